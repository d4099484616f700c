//! Conflict resolution between a local and a remote copy of one entity.

use crate::entity::{EntityKind, SyncRecord};

/// Which side a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the local version.
    KeepLocal,
    /// Accept the remote version.
    AcceptRemote,
}

/// Merge policy for an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The edge copy wins unless the remote copy is explicitly authoritative
    /// or strictly more recent.
    EdgeWins,
    /// The cloud copy always wins.
    CloudWins,
    /// Newest `updatedAt` wins; remote wins ties and incomparable pairs.
    LastWriteWins,
}

impl ConflictPolicy {
    /// Returns the policy for an entity type.
    ///
    /// Alerts and doors are operational state observed at the site. Global
    /// configuration, sites and users are administered in the cloud.
    pub fn for_kind(kind: &EntityKind) -> Self {
        match kind {
            EntityKind::Alert | EntityKind::Door => ConflictPolicy::EdgeWins,
            EntityKind::Config | EntityKind::Site | EntityKind::User => ConflictPolicy::CloudWins,
            EntityKind::Visitor | EntityKind::Other(_) => ConflictPolicy::LastWriteWins,
        }
    }

    /// Arbitrates between two existing versions.
    pub fn resolve(&self, local: &SyncRecord, remote: &SyncRecord) -> ConflictResolution {
        match self {
            ConflictPolicy::CloudWins => ConflictResolution::AcceptRemote,
            ConflictPolicy::EdgeWins => {
                if remote.is_authoritative() && !local.is_authoritative() {
                    return ConflictResolution::AcceptRemote;
                }
                match (local.updated_at(), remote.updated_at()) {
                    (Some(l), Some(r)) if r > l => ConflictResolution::AcceptRemote,
                    _ => ConflictResolution::KeepLocal,
                }
            }
            ConflictPolicy::LastWriteWins => {
                match (local.is_authoritative(), remote.is_authoritative()) {
                    (true, false) => return ConflictResolution::KeepLocal,
                    (false, true) => return ConflictResolution::AcceptRemote,
                    _ => {}
                }
                match (local.updated_at(), remote.updated_at()) {
                    (Some(l), Some(r)) if l > r => ConflictResolution::KeepLocal,
                    _ => ConflictResolution::AcceptRemote,
                }
            }
        }
    }
}

/// Decides which side should become authoritative.
///
/// A remote record with no local counterpart is a first sighting, not a
/// conflict, and is always accepted.
pub fn decide(kind: &EntityKind, local: Option<&SyncRecord>, remote: &SyncRecord) -> ConflictResolution {
    match local {
        None => ConflictResolution::AcceptRemote,
        Some(local) => ConflictPolicy::for_kind(kind).resolve(local, remote),
    }
}

/// Returns the version that should become authoritative.
///
/// Never mutates its inputs; applying the result is the caller's job.
pub fn resolve_conflict(
    kind: &EntityKind,
    local: Option<&SyncRecord>,
    remote: &SyncRecord,
) -> SyncRecord {
    match (decide(kind, local, remote), local) {
        (ConflictResolution::KeepLocal, Some(local)) => local.clone(),
        _ => remote.clone(),
    }
}
