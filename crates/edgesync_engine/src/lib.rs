//! # EdgeSync Engine
//!
//! Keeps a site's local state consistent with the cloud across an
//! unreliable link.
//!
//! This crate provides:
//! - [`SyncEngine`], the orchestrator: change buffering, the tick loop, queue
//!   draining on reconnection, and pull-side conflict resolution
//! - [`SyncClient`], signed HTTPS access to the cloud with certificate pinning
//! - [`HealthMonitor`], which derives the [`OperatingMode`] from probes
//! - Test doubles: [`MockTransport`], [`LoopbackTransport`],
//!   [`StaticCheck`], [`FlakyCheck`], [`MemoryLocalStore`]
//!
//! ## Tick
//!
//! 1. STANDALONE: move buffered changes into the offline queue and stop
//! 2. Deliver queued rows (if any) ahead of buffered changes, otherwise push
//!    the buffer in batches
//! 3. Pull changes since the last successful tick and resolve conflicts
//! 4. Send a heartbeat; failures here never fail the tick
//!
//! ## Key Invariants
//!
//! - Ticks never interleave
//! - `track_change` never waits on the network
//! - A failed push never drops a change: unsent changes go to the queue
//! - The pull checkpoint only moves after a fully successful tick
//!
//! [`OperatingMode`]: edgesync_protocol::OperatingMode

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod engine;
mod error;
mod health;
mod loopback;
mod store;
mod transport;

pub use client::SyncClient;
pub use config::SyncConfig;
pub use engine::{PullSummary, SyncEngine, SyncState, SyncStats, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use health::{
    FlakyCheck, HealthCheck, HealthEvent, HealthMonitor, HealthReport, StaticCheck,
    DEFAULT_PROBE_TIMEOUT,
};
pub use loopback::{LoopbackServer, LoopbackTransport, WireRequest, WireResponse};
pub use store::{LocalStore, MemoryLocalStore};
pub use transport::{MockTransport, SyncTransport};
