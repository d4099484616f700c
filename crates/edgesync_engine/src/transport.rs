//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use edgesync_protocol::{
    HeartbeatRequest, HeartbeatResponse, PullQuery, PullResponse, PushRequest, PushResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Network access to the cloud hub.
///
/// [`SyncClient`](crate::SyncClient) is the production implementation. Every
/// method is bounded by the implementation's timeout.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Sends local changes.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Fetches remote changes.
    async fn pull(&self, query: &PullQuery) -> SyncResult<PullResponse>;

    /// Reports liveness and pending work.
    async fn heartbeat(&self, request: &HeartbeatRequest) -> SyncResult<HeartbeatResponse>;

    /// Probes the unauthenticated liveness endpoint.
    async fn check_health(&self) -> SyncResult<()>;
}

/// A scriptable transport for testing.
///
/// Unscripted calls succeed: pushes are fully acknowledged, pulls return no
/// records and heartbeats are acknowledged. Every request is recorded.
#[derive(Debug)]
pub struct MockTransport {
    reachable: AtomicBool,
    push_results: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_responses: Mutex<VecDeque<PullResponse>>,
    sticky_pull: Mutex<Option<PullResponse>>,
    push_gate: Mutex<Option<Arc<Notify>>>,
    heartbeat_results: Mutex<VecDeque<SyncResult<HeartbeatResponse>>>,
    pushes: Mutex<Vec<PushRequest>>,
    pulls: Mutex<Vec<PullQuery>>,
    heartbeats: Mutex<Vec<HeartbeatRequest>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a reachable mock transport.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            push_results: Mutex::new(VecDeque::new()),
            pull_responses: Mutex::new(VecDeque::new()),
            sticky_pull: Mutex::new(None),
            push_gate: Mutex::new(None),
            heartbeat_results: Mutex::new(VecDeque::new()),
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
        }
    }

    /// Simulates losing or regaining the link.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Scripts the result of the next unscripted push.
    pub fn queue_push_result(&self, result: SyncResult<PushResponse>) {
        self.push_results.lock().push_back(result);
    }

    /// Scripts the response of the next pull.
    pub fn queue_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(response);
    }

    /// Sets a response returned by every pull once the script runs out.
    pub fn set_pull_response(&self, response: PullResponse) {
        *self.sticky_pull.lock() = Some(response);
    }

    /// Makes every push wait, after it is recorded, until the returned
    /// handle is notified once per held push.
    pub fn hold_pushes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.push_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Lets later pushes through without waiting.
    pub fn release_pushes(&self) {
        self.push_gate.lock().take();
    }

    /// Scripts the result of the next heartbeat.
    pub fn queue_heartbeat_result(&self, result: SyncResult<HeartbeatResponse>) {
        self.heartbeat_results.lock().push_back(result);
    }

    /// Returns every push received so far.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    /// Returns every pull received so far.
    pub fn pulls(&self) -> Vec<PullQuery> {
        self.pulls.lock().clone()
    }

    /// Returns every heartbeat received so far.
    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.heartbeats.lock().clone()
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("cloud unreachable"))
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.check_reachable()?;
        self.pushes.lock().push(request.clone());
        let gate = self.push_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.push_results.lock().pop_front().unwrap_or_else(|| {
            Ok(PushResponse::success(request.entities.len() as u32))
        })
    }

    async fn pull(&self, query: &PullQuery) -> SyncResult<PullResponse> {
        self.check_reachable()?;
        self.pulls.lock().push(query.clone());
        let scripted = self.pull_responses.lock().pop_front();
        Ok(scripted
            .or_else(|| self.sticky_pull.lock().clone())
            .unwrap_or_default())
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> SyncResult<HeartbeatResponse> {
        self.check_reachable()?;
        self.heartbeats.lock().push(request.clone());
        self.heartbeat_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HeartbeatResponse::ack()))
    }

    async fn check_health(&self) -> SyncResult<()> {
        self.check_reachable()
    }
}
