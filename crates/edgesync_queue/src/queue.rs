//! The offline queue.

use crate::backend::StorageBackend;
use crate::error::{QueueError, QueueResult, StorageResult};
use crate::file::FileBackend;
use crate::journal::{self, JournalEntry};
use crate::memory::InMemoryBackend;
use chrono::{DateTime, Utc};
use edgesync_protocol::SyncAction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Journal size above which an empty queue is compacted.
const COMPACT_THRESHOLD: u64 = 1024 * 1024;

/// Delivery status of a queued row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Never attempted, or awaiting its first attempt.
    Pending,
    /// At least one push attempt failed; still eligible for retry.
    Failed,
}

/// A row of the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Queue-assigned id, strictly increasing in enqueue order.
    pub id: u64,
    /// Entity type name.
    pub entity: String,
    /// Mutation kind.
    pub operation: SyncAction,
    /// Serialized record.
    pub data: String,
    /// When the change was made.
    pub created_at: DateTime<Utc>,
    /// Delivery status.
    pub status: OperationStatus,
    /// Message of the last failed attempt.
    pub last_error: Option<String>,
    /// Number of failed attempts.
    pub attempts: u32,
}

/// Row counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Rows awaiting a first attempt.
    pub pending: usize,
    /// Rows acknowledged by the cloud.
    pub completed: u64,
    /// Rows awaiting retry after a failure.
    pub failed: usize,
}

impl QueueStats {
    /// Rows not yet delivered (pending plus failed).
    pub fn outstanding(&self) -> usize {
        self.pending + self.failed
    }
}

struct QueueState {
    backend: Box<dyn StorageBackend>,
    rows: BTreeMap<u64, QueuedOperation>,
    leased: HashSet<u64>,
    next_id: u64,
    completed: u64,
    closed: bool,
}

impl QueueState {
    /// Appends one journal frame. A frame that fails partway is cut back
    /// off so the next append does not land behind a torn record.
    fn write(&mut self, entry: &JournalEntry) -> QueueResult<()> {
        let frame = entry.encode_frame()?;
        let start = self.backend.size()?;
        if let Err(e) = append_synced(self.backend.as_mut(), &frame) {
            if let Err(rollback) = self.backend.truncate(start) {
                warn!(error = %rollback, offset = start, "could not roll back failed journal write");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Enqueued(op) => {
                self.next_id = self.next_id.max(op.id + 1);
                self.rows.insert(op.id, op);
            }
            JournalEntry::Completed { ids } => {
                for id in ids {
                    if self.rows.remove(&id).is_some() {
                        self.completed += 1;
                    }
                    self.leased.remove(&id);
                }
            }
            JournalEntry::Failed { ids, reason, .. } => {
                for id in ids {
                    if let Some(row) = self.rows.get_mut(&id) {
                        row.status = OperationStatus::Failed;
                        row.last_error = Some(reason.clone());
                        row.attempts += 1;
                    }
                    self.leased.remove(&id);
                }
            }
            JournalEntry::Checkpoint { next_id, completed } => {
                self.next_id = self.next_id.max(next_id);
                self.completed = completed;
            }
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_compact(&mut self) -> QueueResult<()> {
        if !self.rows.is_empty() || self.backend.size()? < COMPACT_THRESHOLD {
            return Ok(());
        }
        let checkpoint = JournalEntry::Checkpoint {
            next_id: self.next_id,
            completed: self.completed,
        };
        self.backend.truncate(0)?;
        self.write(&checkpoint)?;
        debug!(next_id = self.next_id, "compacted empty queue journal");
        Ok(())
    }
}

fn append_synced(backend: &mut dyn StorageBackend, frame: &[u8]) -> StorageResult<()> {
    backend.append(frame)?;
    backend.flush()?;
    backend.sync()
}

/// Durable, ordered store of mutations awaiting delivery.
///
/// Safe to share between the request path (enqueue, stats) and a drain in
/// progress (dequeue, mark). Each call holds the internal lock only for its
/// own journal append.
pub struct OfflineQueue {
    state: Mutex<QueueState>,
}

impl OfflineQueue {
    /// Opens the queue file at `path`, replaying its journal.
    pub fn open(path: &Path) -> QueueResult<Self> {
        let backend = FileBackend::open(path)?;
        Self::with_backend(Box::new(backend))
    }

    /// Creates a volatile queue.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(QueueState {
                backend: Box::new(InMemoryBackend::new()),
                rows: BTreeMap::new(),
                leased: HashSet::new(),
                next_id: 1,
                completed: 0,
                closed: false,
            }),
        }
    }

    /// Opens a queue over an arbitrary backend, replaying what it holds.
    ///
    /// A torn or corrupt tail is truncated back to the last intact record.
    pub fn with_backend(mut backend: Box<dyn StorageBackend>) -> QueueResult<Self> {
        let replay = journal::replay(backend.as_ref())?;
        if let Some(damage) = &replay.damage {
            warn!(
                damage = %damage,
                kept_bytes = replay.valid_len,
                "offline queue journal has a damaged tail, truncating"
            );
            backend.truncate(replay.valid_len)?;
        }

        let mut state = QueueState {
            backend,
            rows: BTreeMap::new(),
            leased: HashSet::new(),
            next_id: 1,
            completed: 0,
            closed: false,
        };
        for entry in replay.entries {
            state.apply(entry);
        }
        debug!(rows = state.rows.len(), next_id = state.next_id, "offline queue opened");

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Appends a pending row stamped with the current time.
    pub fn enqueue(&self, entity: &str, action: SyncAction, data: &str) -> QueueResult<u64> {
        self.enqueue_at(entity, action, data, Utc::now())
    }

    /// Appends a pending row with an explicit creation time.
    pub fn enqueue_at(
        &self,
        entity: &str,
        action: SyncAction,
        data: &str,
        created_at: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let op = QueuedOperation {
            id: state.next_id,
            entity: entity.to_string(),
            operation: action,
            data: data.to_string(),
            created_at,
            status: OperationStatus::Pending,
            last_error: None,
            attempts: 0,
        };
        let id = op.id;
        let entry = JournalEntry::Enqueued(op);
        state.write(&entry)?;
        state.apply(entry);
        Ok(id)
    }

    /// Leases up to `max` of the oldest undelivered rows.
    ///
    /// Rows stay in the queue until marked complete. The scan stops at the
    /// first row leased by a concurrent drain, so a later row never overtakes
    /// an earlier one; while the oldest row is leased the batch is empty.
    pub fn dequeue(&self, max: usize) -> QueueResult<Vec<QueuedOperation>> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let mut batch = Vec::new();
        for (id, row) in &state.rows {
            if batch.len() >= max {
                break;
            }
            if state.leased.contains(id) {
                break;
            }
            batch.push(row.clone());
        }
        for row in &batch {
            state.leased.insert(row.id);
        }
        Ok(batch)
    }

    /// Deletes delivered rows. Unknown ids are ignored.
    pub fn mark_complete(&self, ids: &[u64]) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let known: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| state.rows.contains_key(id))
            .collect();
        if known.is_empty() {
            return Ok(());
        }

        let entry = JournalEntry::Completed { ids: known };
        state.write(&entry)?;
        state.apply(entry);
        state.maybe_compact()
    }

    /// Records a failed attempt; the rows stay eligible for the next drain.
    pub fn mark_failed(&self, ids: &[u64], reason: &str) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let known: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| state.rows.contains_key(id))
            .collect();
        if known.is_empty() {
            return Ok(());
        }

        let entry = JournalEntry::Failed {
            ids: known,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        state.write(&entry)?;
        state.apply(entry);
        Ok(())
    }

    /// Ends a lease without recording an outcome.
    pub fn release(&self, ids: &[u64]) {
        let mut state = self.state.lock();
        for id in ids {
            state.leased.remove(id);
        }
    }

    /// Returns up to `limit` undelivered rows without leasing them.
    pub fn peek(&self, limit: usize) -> Vec<QueuedOperation> {
        self.state.lock().rows.values().take(limit).cloned().collect()
    }

    /// Returns row counts.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let failed = state
            .rows
            .values()
            .filter(|row| row.status == OperationStatus::Failed)
            .count();
        QueueStats {
            pending: state.rows.len() - failed,
            completed: state.completed,
            failed,
        }
    }

    /// Syncs and closes the queue. Later calls fail with [`QueueError::Closed`].
    pub fn close(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.backend.flush()?;
        state.backend.sync()?;
        state.closed = true;
        Ok(())
    }

    /// Returns true once [`OfflineQueue::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
