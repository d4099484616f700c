//! The seam between the engine and the site's local records.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use edgesync_protocol::{EntityKind, SyncRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Local record access used when applying pulled changes.
///
/// The engine looks up the local version of every pulled record, resolves the
/// pair, and calls [`LocalStore::apply`] only when the outcome differs from
/// what is already stored.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Returns the local version of a record, if any.
    async fn lookup(&self, kind: &EntityKind, id: &str) -> SyncResult<Option<SyncRecord>>;

    /// Stores the resolved version of a record.
    async fn apply(&self, kind: &EntityKind, record: SyncRecord) -> SyncResult<()>;
}

/// A map-backed store for tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    records: RwLock<HashMap<(EntityKind, String), SyncRecord>>,
    applied: AtomicU64,
    failing: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record without counting it as applied.
    pub fn insert(&self, kind: EntityKind, record: SyncRecord) {
        self.records
            .write()
            .insert((kind, record.id().to_string()), record);
    }

    /// Returns a stored record.
    pub fn get(&self, kind: &EntityKind, id: &str) -> Option<SyncRecord> {
        self.records
            .read()
            .get(&(kind.clone(), id.to_string()))
            .cloned()
    }

    /// Returns how many times [`LocalStore::apply`] has written a record.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Makes every call fail, as if the database went away.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::LocalStore("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn lookup(&self, kind: &EntityKind, id: &str) -> SyncResult<Option<SyncRecord>> {
        self.check()?;
        Ok(self.get(kind, id))
    }

    async fn apply(&self, kind: &EntityKind, record: SyncRecord) -> SyncResult<()> {
        self.check()?;
        self.insert(kind.clone(), record);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_and_lookup() {
        let store = MemoryLocalStore::new();
        assert!(store.lookup(&EntityKind::Door, "d1").await.unwrap().is_none());

        store
            .apply(&EntityKind::Door, SyncRecord::new("d1").with_field("locked", true))
            .await
            .unwrap();
        let found = store.lookup(&EntityKind::Door, "d1").await.unwrap().unwrap();
        assert_eq!(found.get("locked"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(store.applied_count(), 1);
        assert!(store.get(&EntityKind::Alert, "d1").is_none());
    }

    #[tokio::test]
    async fn failing_store_reports_local_error() {
        let store = MemoryLocalStore::new();
        store.set_failing(true);
        let err = store.lookup(&EntityKind::Door, "d1").await.unwrap_err();
        assert!(matches!(err, SyncError::LocalStore(_)));
    }
}
