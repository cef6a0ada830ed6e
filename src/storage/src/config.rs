use std::path::Path;

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// WAL location; `None` keeps records in memory only
    pub wal_path: Option<String>,
}

impl StorageConfig {
    /// Create config with WAL enabled at the given path
    pub fn with_wal<P: AsRef<Path>>(path: P) -> Self {
        StorageConfig {
            wal_path: Some(path.as_ref().to_string_lossy().to_string()),
        }
    }

    /// Create config for in-memory only storage
    pub fn in_memory() -> Self {
        StorageConfig { wal_path: None }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("QUORRA_DATA_DIR") {
            let persist = std::env::var("QUORRA_PERSIST")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(true);
            if persist {
                config.wal_path = Some(format!("{}/records.wal", dir));
            }
        }

        config
    }
}
