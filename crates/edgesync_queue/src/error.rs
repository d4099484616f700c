//! Error types for storage and queue operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Another process holds the storage file.
    #[error("storage file is locked by another process: {0}")]
    Locked(PathBuf),
}

/// Errors raised by the offline queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A journal record could not be encoded.
    #[error("journal encode error: {0}")]
    Encode(String),

    /// The queue has been closed.
    #[error("queue is closed")]
    Closed,
}
