//! Submits tasks to the cluster and repairs replicas when quorum is missed.
//!
//! The coordinator runs a task on its own replica first. A local conflict ends
//! the submission there. Otherwise the task goes to every peer, the outcomes
//! are resolved against the task's quorum, and the result is either confirmed
//! on the replicas that applied it or handed to a background compensation that
//! reverses it on exactly those replicas.
//!
//! Replicas that miss the quorum deadline are not forgotten. Their requests
//! are followed for a grace period; a late apply is confirmed when the task
//! committed and compensated along with the others when it did not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ClusterConfig;
use crate::diagnostics::{trace_task, Direction};
use crate::error::ClusterError;
use crate::executor::LocalExecutor;
use crate::outcome::{ExecutionOutcome, ReplicaResponse};
use crate::quorum::{QuorumDecision, QuorumResolver};
use crate::state::TaskState;
use crate::task::RecordTask;
use crate::transport::{Dispatch, Stragglers, Transport};
use crate::types::ReplicaId;

/// What happened to one submitted task.
pub struct SubmitReport {
    pub task: RecordTask,
    pub decision: QuorumDecision,
    /// State of the task on every replica when `submit` returned.
    pub states: HashMap<ReplicaId, TaskState>,
    /// Set when quorum failed and compensation was started.
    pub compensation: Option<CompensationHandle>,
    /// Set when the task committed while some replicas had not answered.
    pub stragglers: Option<StragglerHandle>,
}

impl SubmitReport {
    pub fn is_committed(&self) -> bool {
        self.decision.is_committed()
    }

    pub fn quorum_error(&self) -> Option<ClusterError> {
        if self.decision.is_committed() {
            return None;
        }
        Some(ClusterError::QuorumNotReached {
            operation: self.task.name(),
            rid: self.task.rid,
            successes: self.decision.successes,
            required: self.decision.required,
        })
    }
}

#[derive(Debug)]
pub struct CompensationReport {
    /// Each compensating task with the replicas it was sent to.
    pub tasks: Vec<(RecordTask, Vec<ReplicaId>)>,
    pub states: HashMap<ReplicaId, TaskState>,
}

/// Background compensation of a task that missed quorum.
pub struct CompensationHandle {
    inner: JoinHandle<Result<CompensationReport, ClusterError>>,
}

impl CompensationHandle {
    pub async fn wait(self) -> Result<CompensationReport, ClusterError> {
        self.inner
            .await
            .map_err(|e| ClusterError::Aborted(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// Background follow-up of replicas that answered a committed task late.
pub struct StragglerHandle {
    inner: JoinHandle<Vec<ReplicaId>>,
}

impl StragglerHandle {
    /// Replicas that applied the task late and were confirmed.
    pub async fn wait(self) -> Result<Vec<ReplicaId>, ClusterError> {
        self.inner.await.map_err(|e| ClusterError::Aborted(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

#[derive(Clone)]
pub struct Coordinator {
    node_id: ReplicaId,
    executor: Arc<LocalExecutor>,
    transport: Arc<dyn Transport>,
    peers: Vec<ReplicaId>,
    resolver: QuorumResolver,
    quorum_timeout: Duration,
    late_timeout: Duration,
}

impl Coordinator {
    pub fn new(config: &ClusterConfig, executor: Arc<LocalExecutor>, transport: Arc<dyn Transport>) -> Self {
        let mut resolver = QuorumResolver::new(config.cluster_size());
        if let Some(write_quorum) = config.write_quorum {
            resolver = resolver.with_write_quorum(write_quorum);
        }

        Coordinator {
            node_id: executor.node_id().to_string(),
            executor,
            transport,
            peers: config.replica_ids(),
            resolver,
            quorum_timeout: config.quorum_timeout,
            late_timeout: config.late_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn executor(&self) -> &Arc<LocalExecutor> {
        &self.executor
    }

    pub fn resolver(&self) -> &QuorumResolver {
        &self.resolver
    }

    /// Run `task` across the cluster.
    ///
    /// Returns `VersionConflict` (or `RecordMissing`) when the local replica
    /// rejects the task; in that case nothing was sent to peers. A missed quorum is not an error:
    /// the report carries the decision and a handle to the compensation.
    pub async fn submit(&self, task: RecordTask) -> Result<SubmitReport, ClusterError> {
        trace_task(&self.node_id, Direction::Out, &task);

        let mut states: HashMap<ReplicaId, TaskState> = std::iter::once(self.node_id.clone())
            .chain(self.peers.iter().cloned())
            .map(|replica| (replica, TaskState::Pending))
            .collect();

        let local = match self.executor.execute(&task).await.into_result(&task) {
            Ok(local) => local,
            Err(e) => {
                debug!("{} on {} rejected locally: {}", task.name(), task.rid, e);
                return Err(e);
            }
        };
        advance(&mut states, &self.node_id, TaskState::Applied)?;

        let Dispatch { mut responses, stragglers } = self.gather(&task, &self.peers).await;
        responses.insert(self.node_id.clone(), ReplicaResponse::Completed(local));

        for (replica, response) in &responses {
            match response.outcome() {
                Some(outcome) if outcome.is_applied() && *replica != self.node_id => {
                    advance(&mut states, replica, TaskState::Applied)?
                }
                Some(outcome) if outcome.is_conflict() => advance(&mut states, replica, TaskState::Conflicted)?,
                _ => {}
            }
        }

        let decision = self.resolver.resolve(task.quorum_type(), &responses);
        let applied = applied_replicas(&responses);

        if decision.is_committed() {
            for replica in &applied {
                advance(&mut states, replica, TaskState::Committed)?;
            }
            self.confirm(&task, &applied).await;
            debug!(
                "{} on {} committed ({}/{})",
                task.name(),
                task.rid,
                decision.successes,
                decision.required
            );
            let stragglers = (!stragglers.is_empty()).then(|| self.follow_stragglers(task.clone(), stragglers));
            return Ok(SubmitReport {
                task,
                decision,
                states,
                compensation: None,
                stragglers,
            });
        }

        for replica in &applied {
            advance(&mut states, replica, TaskState::Compensating)?;
        }
        warn!(
            "Quorum not reached for {} on {} ({}/{}), compensating {} replica(s)",
            task.name(),
            task.rid,
            decision.successes,
            decision.required,
            applied.len()
        );

        let this = self.clone();
        let failed = task.clone();
        let inner = tokio::spawn(async move { this.compensate(failed, responses, stragglers).await });

        Ok(SubmitReport {
            task,
            decision,
            states,
            compensation: Some(CompensationHandle { inner }),
            stragglers: None,
        })
    }

    /// Send each replica that applied `task` the task that reverses it.
    ///
    /// A compensating task must apply on every replica it targets. If it does
    /// not, the replicas stay diverged and the failure is escalated; it is
    /// never compensated in turn. Replicas still working on `task` are waited
    /// for first, so one that applies it late is reversed too.
    async fn compensate(
        self,
        task: RecordTask,
        mut responses: HashMap<ReplicaId, ReplicaResponse>,
        stragglers: Stragglers,
    ) -> Result<CompensationReport, ClusterError> {
        if !stragglers.is_empty() {
            let late = stragglers.collect(self.late_timeout).await;
            late_appliers(&task, &late);
            responses.extend(late);
        }

        let good = responses
            .values()
            .filter_map(ReplicaResponse::reported)
            .find(|outcome| !outcome.is_applied() && outcome.observed_version().is_some())
            .cloned();

        let mut replicas: Vec<(&ReplicaId, &ExecutionOutcome)> = responses
            .iter()
            .filter_map(|(replica, response)| response.reported().map(|o| (replica, o)))
            .filter(|(_, outcome)| outcome.is_applied())
            .collect();
        replicas.sort_by(|a, b| a.0.cmp(b.0));

        let mut groups: Vec<(RecordTask, Vec<ReplicaId>)> = Vec::new();
        for (replica, bad) in replicas {
            let compensation = match &good {
                Some(good) => task.fix_task(bad, good),
                None => task.undo_task(bad),
            };
            let compensation = compensation.inspect_err(|e| {
                error!("Replicas of {} left diverged: {}", task.rid, e);
            })?;

            match groups.iter_mut().find(|(t, _)| *t == compensation) {
                Some((_, targets)) => targets.push(replica.clone()),
                None => groups.push((compensation, vec![replica.clone()])),
            }
        }

        let mut states = HashMap::new();
        let mut escalation = None;

        for (compensation, targets) in &groups {
            let peers: Vec<ReplicaId> = targets.iter().filter(|r| **r != self.node_id).cloned().collect();
            let local = if peers.len() < targets.len() {
                Some(self.executor.execute(compensation).await)
            } else {
                None
            };

            // a compensation that misses the deadline escalates; its stragglers are left detached
            let Dispatch { mut responses, .. } = self.gather(compensation, &peers).await;
            if let Some(local) = local {
                responses.insert(self.node_id.clone(), ReplicaResponse::Completed(local));
            }

            let resolver = QuorumResolver::new(targets.len()).with_write_quorum(targets.len());
            let decision = resolver.resolve(compensation.quorum_type(), &responses);

            if decision.is_committed() {
                self.confirm(compensation, targets).await;
                for replica in targets {
                    states.insert(replica.clone(), TaskState::Done);
                }
                info!(
                    "Compensated {} on {} with {} on {} replica(s)",
                    task.name(),
                    task.rid,
                    compensation.name(),
                    targets.len()
                );
            } else {
                for replica in targets {
                    states.insert(replica.clone(), TaskState::Escalated);
                }
                let err = ClusterError::CompensationFailed {
                    operation: compensation.name(),
                    rid: compensation.rid,
                    successes: decision.successes,
                    required: decision.required,
                };
                error!("Replicas of {} left diverged: {}", task.rid, err);
                escalation.get_or_insert(err);
            }
        }

        match escalation {
            Some(err) => Err(err),
            None => Ok(CompensationReport { tasks: groups, states }),
        }
    }

    /// Confirm `task` on replicas that apply it after it already committed.
    fn follow_stragglers(&self, task: RecordTask, stragglers: Stragglers) -> StragglerHandle {
        debug!(
            "Following {} straggler(s) of {} on {}",
            stragglers.replicas().len(),
            task.name(),
            task.rid
        );
        let this = self.clone();
        let inner = tokio::spawn(async move {
            let late = stragglers.collect(this.late_timeout).await;
            let applied = late_appliers(&task, &late);
            this.confirm(&task, &applied).await;
            applied
        });
        StragglerHandle { inner }
    }

    /// Dispatch to `peers` under the quorum deadline. Peers the transport did
    /// not report on count as timed out.
    async fn gather(&self, task: &RecordTask, peers: &[ReplicaId]) -> Dispatch {
        if peers.is_empty() {
            return Dispatch::default();
        }
        let deadline = Instant::now() + self.quorum_timeout;
        let mut dispatch = self.transport.dispatch(task, peers, deadline).await;
        for peer in peers {
            dispatch.responses.entry(peer.clone()).or_insert(ReplicaResponse::TimedOut);
        }
        dispatch
    }

    async fn confirm(&self, task: &RecordTask, replicas: &[ReplicaId]) {
        if replicas.iter().any(|r| *r == self.node_id) {
            if let Err(e) = self.executor.confirm(task).await {
                warn!("Local confirm of {} on {} failed: {}", task.name(), task.rid, e);
            }
        }
        let peers: Vec<ReplicaId> = replicas.iter().filter(|r| **r != self.node_id).cloned().collect();
        if !peers.is_empty() {
            self.transport.confirm(task, &peers).await;
        }
    }
}

fn applied_replicas(responses: &HashMap<ReplicaId, ReplicaResponse>) -> Vec<ReplicaId> {
    let mut applied: Vec<ReplicaId> = responses
        .iter()
        .filter(|(_, response)| response.is_success())
        .map(|(replica, _)| replica.clone())
        .collect();
    applied.sort();
    applied
}

/// Log what stragglers finally reported and return those that applied.
fn late_appliers(task: &RecordTask, late: &HashMap<ReplicaId, ReplicaResponse>) -> Vec<ReplicaId> {
    let mut applied = Vec::new();
    for (replica, response) in late {
        match response {
            ReplicaResponse::Late(outcome) => {
                warn!(
                    "Late response from {} for {} on {}: {:?}",
                    replica,
                    task.name(),
                    task.rid,
                    outcome
                );
                if outcome.is_applied() {
                    applied.push(replica.clone());
                }
            }
            other => debug!("No answer from {} for {} on {}: {:?}", replica, task.name(), task.rid, other),
        }
    }
    applied.sort();
    applied
}

fn advance(states: &mut HashMap<ReplicaId, TaskState>, replica: &str, next: TaskState) -> Result<(), ClusterError> {
    match states.get_mut(replica) {
        Some(state) => state.advance(next),
        None => Ok(()),
    }
}
