use thiserror::Error;

/// Failure to decode a binary payload (WAL entry, version, wire frame).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid record id '{0}'")]
    InvalidRecordId(String),

    #[error("checksum mismatch: stored={stored}, calculated={calculated}")]
    ChecksumMismatch { stored: u32, calculated: u32 },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("bad magic")]
    BadMagic,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Errors raised by the local record store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}
