//! In-memory record store of the hub.

use chrono::{DateTime, Utc};
use edgesync_protocol::{EntityKind, SyncAction, SyncEntity, SyncRecord};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Site id used for records written on the hub itself.
pub const HUB_ORIGIN: &str = "cloud";

/// Field set on records whose last action was a delete.
pub const DELETED_FIELD: &str = "deleted";

#[derive(Debug, Clone)]
struct StoredRecord {
    record: SyncRecord,
    changed_at: DateTime<Utc>,
    origin: String,
}

/// Latest version of every record, keyed by type and id.
///
/// Deletes leave a tombstone so the removal reaches the other sites on
/// their next pull.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<BTreeMap<(EntityKind, String), StoredRecord>>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one pushed change from `origin`.
    pub fn apply(&self, origin: &str, entity: &SyncEntity, now: DateTime<Utc>) {
        let record = match entity.action() {
            SyncAction::Create | SyncAction::Update => entity.data().clone(),
            SyncAction::Delete => entity.data().clone().with_field(DELETED_FIELD, true),
        };
        self.put(entity.entity_type().clone(), record, origin, now);
    }

    /// Writes a record directly.
    pub fn put(&self, kind: EntityKind, record: SyncRecord, origin: &str, now: DateTime<Utc>) {
        let key = (kind, record.id().to_string());
        self.records.write().insert(
            key,
            StoredRecord {
                record,
                changed_at: now,
                origin: origin.to_string(),
            },
        );
    }

    /// Returns records changed after `since`, skipping those last written by
    /// `requester` and those outside the optional type filter.
    pub fn changes_since(
        &self,
        since: DateTime<Utc>,
        entities: Option<&[EntityKind]>,
        requester: &str,
    ) -> Vec<(EntityKind, SyncRecord)> {
        self.records
            .read()
            .iter()
            .filter(|(_, stored)| stored.changed_at > since && stored.origin != requester)
            .filter(|((kind, _), _)| entities.map_or(true, |wanted| wanted.contains(kind)))
            .map(|((kind, _), stored)| (kind.clone(), stored.record.clone()))
            .collect()
    }

    /// Returns the current version of a record.
    pub fn get(&self, kind: &EntityKind, id: &str) -> Option<SyncRecord> {
        self.records
            .read()
            .get(&(kind.clone(), id.to_string()))
            .map(|stored| stored.record.clone())
    }

    /// Returns true if the record's last action was a delete.
    pub fn is_deleted(&self, kind: &EntityKind, id: &str) -> bool {
        self.get(kind, id)
            .and_then(|record| record.get(DELETED_FIELD).and_then(|v| v.as_bool()))
            .unwrap_or(false)
    }

    /// Returns the number of stored records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
