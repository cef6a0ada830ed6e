use std::sync::Arc;

use cluster::{ClusterConfig, ClusterError, ClusterManager};
use log::{error, info};
use logger::logger;
use storage::{Storage, StorageConfig};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn load_cluster_config() -> Result<ClusterConfig, ClusterError> {
    if let Ok(path) = std::env::var("QUORRA_CLUSTER_CONFIG") {
        info!("Loading cluster configuration from {}", path);
        return ClusterConfig::from_toml_file(path);
    }
    ClusterConfig::from_env()?
        .ok_or_else(|| ClusterError::Config("set QUORRA_NODE_ID or QUORRA_CLUSTER_CONFIG".to_string()))
}

#[tokio::main]
async fn main() {
    logger::setup_logging();

    let config = match load_cluster_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load cluster configuration: {}", e);
            std::process::exit(1);
        }
    };

    let storage = match Storage::with_config(StorageConfig::from_env()) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Failed to open record storage: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting replica {} with {} record(s) in a cluster of {}",
        config.node_id,
        storage.len().await,
        config.cluster_size()
    );

    let manager = Arc::new(ClusterManager::new(config, storage));
    let server = tokio::spawn(manager.clone().start());

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Replica listener failed: {}", e);
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Replica listener panicked: {}", e);
                    std::process::exit(1);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            manager.shutdown();
        }
    }
}
