// Task model
pub mod task;
pub mod outcome;
pub mod state;
pub mod quorum;

// Execution and coordination
pub mod executor;
pub mod coordinator;
pub mod manager;

// Wire and transport
pub mod codec;
pub mod transport;

// Support modules
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::ClusterConfig;
pub use coordinator::{CompensationHandle, CompensationReport, Coordinator, StragglerHandle, SubmitReport};
pub use error::ClusterError;
pub use executor::LocalExecutor;
pub use manager::ClusterManager;
pub use outcome::{ExecutionOutcome, ReplicaResponse};
pub use quorum::{QuorumDecision, QuorumResolver, QuorumType, Verdict};
pub use state::TaskState;
pub use task::{RecordTask, TaskKind};
pub use transport::{Dispatch, LocalTransport, Stragglers, TcpTransport, Transport};
pub use types::*;
