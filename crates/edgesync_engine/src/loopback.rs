//! In-process transport for wiring the engine to a hub without a network.
//!
//! Requests are signed and encoded exactly as [`SyncClient`](crate::SyncClient)
//! does, so a hub behind a [`LoopbackServer`] verifies the same bytes it would
//! see over HTTP.

use crate::client::{decode_response, encode_body};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use edgesync_protocol::{
    HeartbeatRequest, HeartbeatResponse, PullQuery, PullResponse, PushRequest, PushResponse,
    RequestSigner, HEALTH_PATH, HEARTBEAT_PATH, PUSH_PATH,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// A request as it would be sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    /// HTTP method.
    pub method: &'static str,
    /// Path and query.
    pub target: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl WireRequest {
    /// Returns a header value, matching the name case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response from an in-process server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    /// HTTP status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// Something that answers wire requests in-process.
pub trait LoopbackServer: Send + Sync {
    /// Handles one request.
    fn handle(&self, request: &WireRequest) -> WireResponse;
}

/// A [`SyncTransport`] that hands signed requests to a [`LoopbackServer`].
pub struct LoopbackTransport<S> {
    server: S,
    signer: RequestSigner,
    reachable: AtomicBool,
}

impl<S: LoopbackServer> LoopbackTransport<S> {
    /// Creates a transport signing with the configured key.
    pub fn new(server: S, config: &SyncConfig) -> Self {
        Self {
            server,
            signer: RequestSigner::new(config.key_id(), config.signing_key.as_bytes().to_vec()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }

    /// Simulates losing or regaining the link.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn send(&self, method: &'static str, target: String, body: Vec<u8>) -> SyncResult<WireResponse> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("loopback link down"));
        }
        let signed = self.signer.sign(method, &target, &body);
        let headers = signed
            .pairs()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Ok(self.server.handle(&WireRequest {
            method,
            target,
            headers,
            body,
        }))
    }
}

#[async_trait]
impl<S: LoopbackServer> SyncTransport for LoopbackTransport<S> {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let response = self.send("POST", PUSH_PATH.to_string(), encode_body(request)?)?;
        decode_response(response.status, &response.body, "push")
    }

    async fn pull(&self, query: &PullQuery) -> SyncResult<PullResponse> {
        let response = self.send("GET", query.request_target(), Vec::new())?;
        decode_response(response.status, &response.body, "pull")
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> SyncResult<HeartbeatResponse> {
        let response = self.send("POST", HEARTBEAT_PATH.to_string(), encode_body(request)?)?;
        decode_response(response.status, &response.body, "heartbeat")
    }

    async fn check_health(&self) -> SyncResult<()> {
        let response = self.send("GET", HEALTH_PATH.to_string(), Vec::new())?;
        if (200..300).contains(&response.status) {
            Ok(())
        } else {
            Err(SyncError::Http {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            })
        }
    }
}
