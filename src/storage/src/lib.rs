// Core modules
pub mod types;
pub mod version;
pub mod config;
pub mod error;
pub mod storage;

// Support modules
pub mod buf;
pub mod wal;

// Re-export main types for convenience
pub use types::{RecordId, RecordSnapshot, current_timestamp_ms};
pub use version::{RecordVersion, VersionCodec, VersionKind, VERSION_CODECS};
pub use config::StorageConfig;
pub use error::{DecodeError, StorageError};
pub use storage::Storage;
pub use buf::ByteReader;
