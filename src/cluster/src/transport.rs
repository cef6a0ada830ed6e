//! Delivery of tasks to replicas.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use crate::codec::{decode_outcome, encode_task, read_frame, write_frame};
use crate::diagnostics::{trace_task, Direction};
use crate::error::ClusterError;
use crate::executor::LocalExecutor;
use crate::outcome::{ExecutionOutcome, ReplicaResponse};
use crate::task::RecordTask;
use crate::types::*;

type Request = JoinHandle<Result<ExecutionOutcome, ClusterError>>;

/// What a dispatch learned by its deadline.
#[derive(Default)]
pub struct Dispatch {
    /// One entry per target.
    pub responses: HashMap<ReplicaId, ReplicaResponse>,
    /// Requests still in flight for targets reported as `TimedOut`.
    pub stragglers: Stragglers,
}

impl Dispatch {
    pub fn new(responses: HashMap<ReplicaId, ReplicaResponse>) -> Self {
        Dispatch {
            responses,
            stragglers: Stragglers::default(),
        }
    }
}

/// Requests that missed the quorum deadline but may still apply on their
/// replica. Dropping this detaches them.
#[derive(Default)]
pub struct Stragglers {
    pending: Vec<(ReplicaId, Request)>,
}

impl Stragglers {
    pub fn push(&mut self, replica: ReplicaId, request: Request) {
        self.pending.push((replica, request));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn replicas(&self) -> Vec<ReplicaId> {
        self.pending.iter().map(|(replica, _)| replica.clone()).collect()
    }

    /// Wait up to `grace` for the remaining answers.
    ///
    /// An answer becomes `Late`; a failed request `Unreachable`. Requests
    /// still running at the end of `grace` are aborted and stay `TimedOut`.
    pub async fn collect(self, grace: Duration) -> HashMap<ReplicaId, ReplicaResponse> {
        let deadline = Instant::now() + grace;
        let waits = self.pending.into_iter().map(|(replica, mut request)| async move {
            let result = timeout_at(deadline, &mut request).await;
            let response = match result {
                Ok(Ok(Ok(outcome))) => ReplicaResponse::Late(outcome),
                Ok(Ok(Err(e))) => ReplicaResponse::Unreachable { reason: e.to_string() },
                Ok(Err(e)) => ReplicaResponse::Unreachable { reason: e.to_string() },
                Err(_) => {
                    request.abort();
                    debug!("Gave up waiting on {}", replica);
                    ReplicaResponse::TimedOut
                }
            };
            (replica, response)
        });
        join_all(waits).await.into_iter().collect()
    }
}

/// Moves tasks and confirmations between a coordinator and its replicas.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `task` to every target and gather what each one reports by
    /// `deadline`. Requests that are still running at the deadline are
    /// handed back as stragglers instead of being dropped.
    async fn dispatch(&self, task: &RecordTask, targets: &[ReplicaId], deadline: Instant) -> Dispatch;

    /// Tell targets that `task` reached quorum. Failures are logged.
    async fn confirm(&self, task: &RecordTask, targets: &[ReplicaId]);
}

/// Await `request` until `deadline`, keeping it as a straggler if it runs over.
async fn settle(replica: &ReplicaId, mut request: Request, deadline: Instant) -> (ReplicaResponse, Option<Request>) {
    let result = timeout_at(deadline, &mut request).await;
    match result {
        Ok(Ok(Ok(outcome))) => (ReplicaResponse::Completed(outcome), None),
        Ok(Ok(Err(e))) => {
            debug!("Replica {} unreachable: {}", replica, e);
            (ReplicaResponse::Unreachable { reason: e.to_string() }, None)
        }
        Ok(Err(e)) => (ReplicaResponse::Unreachable { reason: e.to_string() }, None),
        Err(_) => (ReplicaResponse::TimedOut, Some(request)),
    }
}

async fn settle_all(calls: impl Iterator<Item = (ReplicaId, Option<Request>)>, deadline: Instant) -> Dispatch {
    let settled = join_all(calls.map(|(replica, request)| async move {
        match request {
            Some(request) => {
                let (response, straggler) = settle(&replica, request, deadline).await;
                (replica, response, straggler)
            }
            None => (replica, ReplicaResponse::TimedOut, None),
        }
    }))
    .await;

    let mut dispatch = Dispatch::default();
    for (replica, response, straggler) in settled {
        if let Some(request) = straggler {
            dispatch.stragglers.push(replica.clone(), request);
        }
        dispatch.responses.insert(replica, response);
    }
    dispatch
}

/// Replicas living in the same process. A partitioned replica never receives
/// anything; a delayed one receives tasks only after its delay.
#[derive(Default)]
pub struct LocalTransport {
    replicas: HashMap<ReplicaId, Arc<LocalExecutor>>,
    partitioned: Mutex<HashSet<ReplicaId>>,
    delays: Mutex<HashMap<ReplicaId, Duration>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replica(&mut self, executor: Arc<LocalExecutor>) {
        self.replicas.insert(executor.node_id().to_string(), executor);
    }

    pub fn partition(&self, replica: &str) {
        if let Ok(mut partitioned) = self.partitioned.lock() {
            partitioned.insert(replica.to_string());
        }
    }

    pub fn heal(&self, replica: &str) {
        if let Ok(mut partitioned) = self.partitioned.lock() {
            partitioned.remove(replica);
        }
        if let Ok(mut delays) = self.delays.lock() {
            delays.remove(replica);
        }
    }

    /// Hold back every task sent to `replica` by `delay`.
    pub fn delay(&self, replica: &str, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(replica.to_string(), delay);
        }
    }

    fn reachable(&self, replica: &str) -> Option<Arc<LocalExecutor>> {
        let partitioned = self
            .partitioned
            .lock()
            .map(|p| p.contains(replica))
            .unwrap_or(false);
        if partitioned {
            None
        } else {
            self.replicas.get(replica).cloned()
        }
    }

    fn delay_of(&self, replica: &str) -> Option<Duration> {
        self.delays.lock().ok().and_then(|d| d.get(replica).copied())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn dispatch(&self, task: &RecordTask, targets: &[ReplicaId], deadline: Instant) -> Dispatch {
        let calls = targets.iter().map(|target| {
            let request = self.reachable(target).map(|executor| {
                let task = task.clone();
                let delay = self.delay_of(target);
                tokio::spawn(async move {
                    if let Some(delay) = delay {
                        sleep(delay).await;
                    }
                    Ok::<_, ClusterError>(executor.execute(&task).await)
                })
            });
            (target.clone(), request)
        });
        settle_all(calls, deadline).await
    }

    async fn confirm(&self, task: &RecordTask, targets: &[ReplicaId]) {
        for target in targets {
            if let Some(executor) = self.reachable(target) {
                if let Err(e) = executor.confirm(task).await {
                    warn!("Confirm of {} on {} failed: {}", task.name(), target, e);
                }
            }
        }
    }
}

/// Replicas reached over the framed TCP protocol, one connection per request.
pub struct TcpTransport {
    node_id: String,
    peers: HashMap<ReplicaId, PeerNode>,
    confirm_timeout: Duration,
}

impl TcpTransport {
    pub fn new(node_id: impl Into<String>, peers: Vec<PeerNode>, confirm_timeout: Duration) -> Self {
        TcpTransport {
            node_id: node_id.into(),
            peers: peers.into_iter().map(|p| (p.id.clone(), p)).collect(),
            confirm_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dispatch(&self, task: &RecordTask, targets: &[ReplicaId], deadline: Instant) -> Dispatch {
        trace_task(&self.node_id, Direction::Out, task);
        let payload = Arc::new(encode_task(task));

        let mut unknown = HashMap::new();
        let mut calls = Vec::new();
        for target in targets {
            match self.peers.get(target) {
                Some(peer) => {
                    let addr = peer.cluster_addr();
                    let payload = payload.clone();
                    let request = tokio::spawn(async move { send_task(&addr, &payload).await });
                    calls.push((target.clone(), Some(request)));
                }
                None => {
                    unknown.insert(
                        target.clone(),
                        ReplicaResponse::Unreachable { reason: "unknown replica".to_string() },
                    );
                }
            }
        }

        let mut dispatch = settle_all(calls.into_iter(), deadline).await;
        dispatch.responses.extend(unknown);
        dispatch
    }

    async fn confirm(&self, task: &RecordTask, targets: &[ReplicaId]) {
        let payload = encode_task(task);
        let calls = targets.iter().filter_map(|target| self.peers.get(target)).map(|peer| {
            let payload = &payload;
            async move {
                let result = timeout(self.confirm_timeout, send_confirm(&peer.cluster_addr(), payload)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Confirm of {} to {} failed: {}", task.name(), peer.id, e),
                    Err(_) => warn!("Confirm of {} to {} timed out", task.name(), peer.id),
                }
            }
        });
        join_all(calls).await;
    }
}

async fn send_task(addr: &str, payload: &[u8]) -> Result<ExecutionOutcome, ClusterError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, CLUSTER_OP_TASK, payload).await?;

    match read_frame(&mut stream).await? {
        Some((CLUSTER_OP_TASK_ACK, body)) => Ok(decode_outcome(&body)?),
        Some((op, _)) => Err(ClusterError::Transport(format!("unexpected reply op {}", op))),
        None => Err(ClusterError::Transport("connection closed before reply".to_string())),
    }
}

async fn send_confirm(addr: &str, payload: &[u8]) -> Result<(), ClusterError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, CLUSTER_OP_CONFIRM, payload).await?;

    match read_frame(&mut stream).await? {
        Some((CLUSTER_OP_CONFIRM_ACK, _)) => Ok(()),
        Some((op, _)) => Err(ClusterError::Transport(format!("unexpected reply op {}", op))),
        None => Err(ClusterError::Transport("connection closed before reply".to_string())),
    }
}
