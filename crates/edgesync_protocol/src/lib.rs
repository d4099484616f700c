//! # EdgeSync Protocol
//!
//! Wire types and pure logic shared by the edge agent and the cloud hub.
//!
//! This crate provides:
//! - [`SyncEntity`] and [`SyncRecord`], the replicated units of change
//! - Push / pull / heartbeat request and response bodies
//! - HMAC request signing ([`RequestSigner`]) and verification ([`SignatureVerifier`])
//! - Per-entity-type conflict resolution ([`resolve_conflict`])
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod conflict;
mod entity;
mod error;
mod messages;
mod mode;

pub use auth::{
    RequestSigner, SignatureVerifier, SignedHeaders, KEY_HEADER, MAX_CLOCK_SKEW, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use conflict::{decide, resolve_conflict, ConflictPolicy, ConflictResolution};
pub use entity::{EntityKind, SyncAction, SyncEntity, SyncRecord};
pub use error::{AuthError, ProtocolError, ProtocolResult};
pub use messages::{
    HeartbeatRequest, HeartbeatResponse, PeerInfo, PullQuery, PullResponse, PulledRecord,
    PushRequest, PushResponse, UpgradeCommand, HEALTH_PATH, HEARTBEAT_PATH, PULL_PATH, PUSH_PATH,
};
pub use mode::OperatingMode;
