use std::sync::Arc;

use log::{error, info, warn};
use storage::Storage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::codec::{decode_task, encode_outcome, read_frame, write_frame};
use crate::config::ClusterConfig;
use crate::coordinator::Coordinator;
use crate::error::ClusterError;
use crate::executor::LocalExecutor;
use crate::outcome::ExecutionOutcome;
use crate::transport::{TcpTransport, Transport};
use crate::types::*;

/// A replica node: serves tasks sent by coordinators and coordinates its own.
pub struct ClusterManager {
    config: ClusterConfig,
    executor: Arc<LocalExecutor>,
    coordinator: Coordinator,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig, storage: Storage) -> Self {
        let transport = Arc::new(TcpTransport::new(
            config.node_id.clone(),
            config.replicas.clone(),
            config.quorum_timeout,
        ));
        Self::with_transport(config, storage, transport)
    }

    pub fn with_transport(config: ClusterConfig, storage: Storage, transport: Arc<dyn Transport>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let executor = Arc::new(LocalExecutor::new(config.node_id.clone(), storage));
        let coordinator = Coordinator::new(&config, executor.clone(), transport);

        ClusterManager {
            config,
            executor,
            coordinator,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn executor(&self) -> &Arc<LocalExecutor> {
        &self.executor
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Accept replica connections on the cluster port until shutdown.
    pub async fn start(self: Arc<Self>) -> Result<(), ClusterError> {
        let addr = format!("0.0.0.0:{}", self.config.cluster_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "Replica {} listening on {} ({} peer(s), write quorum {})",
            self.config.node_id,
            addr,
            self.config.replicas.len(),
            self.coordinator.resolver().write_quorum()
        );
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ClusterError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept replica connection: {}", e);
                            continue;
                        }
                    };
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_cluster_connection(stream, executor).await {
                            error!("Replica connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Replica {} shutting down", self.config.node_id);
                    return Ok(());
                }
            }
        }
    }

    /// Shutdown the cluster manager
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn handle_cluster_connection(mut stream: TcpStream, executor: Arc<LocalExecutor>) -> Result<(), ClusterError> {
    while let Some((op, payload)) = read_frame(&mut stream).await? {
        match op {
            CLUSTER_OP_TASK => {
                let outcome = match decode_task(&payload) {
                    Ok(task) => executor.execute(&task).await,
                    Err(e) => {
                        warn!("Rejected undecodable task: {}", e);
                        ExecutionOutcome::error(format!("undecodable task: {}", e))
                    }
                };
                write_frame(&mut stream, CLUSTER_OP_TASK_ACK, &encode_outcome(&outcome)).await?;
            }
            CLUSTER_OP_CONFIRM => {
                let task = decode_task(&payload)?;
                executor.confirm(&task).await?;
                write_frame(&mut stream, CLUSTER_OP_CONFIRM_ACK, &[]).await?;
            }
            _ => {
                info!("Unknown cluster operation: {}", op);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use storage::{RecordId, RecordSnapshot, RecordVersion};
    use tokio::time::Instant;

    use crate::task::RecordTask;

    async fn spawn_replica(id: &str) -> (Arc<ClusterManager>, PeerNode) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = Arc::new(ClusterManager::new(ClusterConfig::new(id, Vec::new()), Storage::new()));
        tokio::spawn(manager.clone().serve(listener));
        (manager, PeerNode::new(id, "127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_tcp_dispatch_and_confirm() {
        let (replica, peer) = spawn_replica("node2").await;
        let rid = RecordId::new(10, 5);
        replica
            .executor()
            .storage()
            .apply_create(rid, b"doc".to_vec(), RecordVersion::Simple(3))
            .await
            .unwrap();

        let transport = TcpTransport::new("node1", vec![peer], Duration::from_secs(1));
        let delete = RecordTask::delete(rid, RecordVersion::Simple(3));
        let targets = vec!["node2".to_string()];

        let responses = transport
            .dispatch(&delete, &targets, Instant::now() + Duration::from_secs(2))
            .await
            .responses;
        assert_eq!(
            responses["node2"].outcome(),
            Some(&ExecutionOutcome::Applied {
                before: Some(RecordSnapshot::new("doc", RecordVersion::Simple(3))),
                after: None,
            })
        );
        assert_eq!(replica.executor().storage().deferred_len().await, 1);

        transport.confirm(&delete, &targets).await;
        assert_eq!(replica.executor().storage().deferred_len().await, 0);

        replica.shutdown();
    }

    #[tokio::test]
    async fn test_tcp_conflict_outcome() {
        let (replica, peer) = spawn_replica("node2").await;
        let rid = RecordId::new(10, 5);
        replica
            .executor()
            .storage()
            .apply_create(rid, b"doc".to_vec(), RecordVersion::Simple(4))
            .await
            .unwrap();

        let transport = TcpTransport::new("node1", vec![peer], Duration::from_secs(1));
        let responses = transport
            .dispatch(
                &RecordTask::delete(rid, RecordVersion::Simple(3)),
                &["node2".to_string()],
                Instant::now() + Duration::from_secs(2),
            )
            .await
            .responses;
        assert_eq!(
            responses["node2"].outcome(),
            Some(&ExecutionOutcome::Conflict { observed: RecordVersion::Simple(4) })
        );
        replica.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_replica() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(
            "node1",
            vec![PeerNode::new("node2", "127.0.0.1", port)],
            Duration::from_millis(200),
        );
        let responses = transport
            .dispatch(
                &RecordTask::resurrect(RecordId::new(1, 1), RecordVersion::Simple(1)),
                &["node2".to_string()],
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .responses;
        assert!(!responses["node2"].is_success());
        assert!(responses["node2"].outcome().is_none());
    }
}
