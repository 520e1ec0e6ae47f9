//! Error types for the bogn storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Allocation too large: {size} > {max}")]
    AllocTooLarge { size: usize, max: usize },

    #[error("Entry exceeds block size: {size} > {blocksize}")]
    EntryExceedsBlockSize { size: usize, blocksize: usize },

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Invalid marker block: {0}")]
    InvalidMarker(std::path::PathBuf),

    #[error("Partial read: {0}")]
    PartialRead(String),

    #[error("Invalid CAS")]
    InvalidCas,

    #[error("Transaction rollback")]
    Rollback,

    #[error("Snapshot in use: {0}")]
    SnapshotInUse(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Flusher error: {0}")]
    Flusher(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Index closed: {0}")]
    Closed(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
