//! # EdgeSync Queue
//!
//! Durable, ordered holding area for local mutations that could not be sent
//! to the cloud immediately.
//!
//! ## Design
//!
//! - Storage backends are opaque append-only byte stores ([`StorageBackend`])
//! - The queue writes a journal of framed, checksummed records on top
//! - Opening a queue replays the journal; a torn tail is cut off
//! - `dequeue` leases rows instead of removing them, so a crash between
//!   dequeue and acknowledgement loses nothing
//!
//! ## Invariants
//!
//! - Rows are returned in enqueue order, always
//! - Every mutation is synced before the call returns
//!
//! ## Example
//!
//! ```rust
//! use edgesync_protocol::SyncAction;
//! use edgesync_queue::OfflineQueue;
//!
//! let queue = OfflineQueue::in_memory();
//! queue.enqueue("door", SyncAction::Update, r#"{"id":"d1"}"#).unwrap();
//!
//! let batch = queue.dequeue(10).unwrap();
//! queue.mark_complete(&[batch[0].id]).unwrap();
//! assert_eq!(queue.stats().pending, 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;
mod queue;

pub use backend::StorageBackend;
pub use error::{QueueError, QueueResult, StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use queue::{OfflineQueue, OperationStatus, QueueStats, QueuedOperation};
