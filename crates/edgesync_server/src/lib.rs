//! # Edge Sync Hub
//!
//! Reference request handler for the cloud side of edge-cloud sync.
//!
//! This crate provides:
//! - Signature verification of incoming requests
//! - `POST /sync/push`, `GET /sync/pull`, `POST /sync/heartbeat`, `GET /health`
//! - An in-memory record store with delete tombstones
//! - Per-site heartbeat status, optional upgrade and peer advertisement
//!
//! The hub does not open sockets. Tests feed it requests directly, and a
//! deployment would put it behind any HTTP listener.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod handler;
mod server;
mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler, SiteStatus};
pub use server::{HubRequest, HubResponse, SyncServer};
pub use store::{RecordStore, DELETED_FIELD, HUB_ORIGIN};
