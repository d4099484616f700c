//! Request routing and authentication.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler, SiteStatus};
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use edgesync_protocol::{
    SignatureVerifier, SignedHeaders, HEALTH_PATH, HEARTBEAT_PATH, PULL_PATH, PUSH_PATH,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// An HTTP request as seen by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct HubRequest {
    /// Upper-case method.
    pub method: String,
    /// Path including the query string.
    pub target: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HubRequest {
    /// Creates a request without headers.
    pub fn new(method: impl Into<String>, target: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Vec::new(),
            body,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Looks a header up by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    /// Returns the query string, empty if there is none.
    pub fn query(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, q)| q)
    }
}

/// A response produced by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct HubResponse {
    /// HTTP status code.
    pub status: u16,
    /// JSON body.
    pub body: Vec<u8>,
}

impl HubResponse {
    fn json<T: Serialize>(value: &T) -> ServerResult<Self> {
        let body = serde_json::to_vec(value).map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(Self { status: 200, body })
    }

    fn error(err: &ServerError) -> Self {
        Self {
            status: err.status_code(),
            body: json!({ "error": err.to_string() }).to_string().into_bytes(),
        }
    }
}

enum Route {
    Health,
    Push,
    Pull,
    Heartbeat,
}

/// The reference hub.
///
/// Every route except `GET /health` requires a valid request signature.
/// The hub is a request handler only; wiring it to a listener is left to
/// the embedding program.
///
/// # Example
///
/// ```
/// use edgesync_server::{HubRequest, ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::new().with_key("site-1", b"secret".to_vec()));
/// let response = server.handle(&HubRequest::new("GET", "/health", Vec::new()), 0);
/// assert_eq!(response.status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    verifier: SignatureVerifier,
}

impl SyncServer {
    /// Creates a hub with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(RecordStore::new()))
    }

    /// Creates a hub over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<RecordStore>) -> Self {
        let verifier = config
            .keys
            .iter()
            .fold(SignatureVerifier::new(), |v, (id, secret)| {
                v.with_key(id.clone(), secret.clone())
            })
            .with_max_skew(config.max_skew);
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self {
            handler,
            context,
            verifier,
        }
    }

    /// Handles one request at hub time `now_ms` (unix milliseconds).
    pub fn handle(&self, request: &HubRequest, now_ms: i64) -> HubResponse {
        match self.dispatch(request, now_ms) {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    warn!(path = %request.target, error = %e, "request failed");
                } else {
                    warn!(path = %request.target, status = e.status_code(), error = %e, "request rejected");
                }
                HubResponse::error(&e)
            }
        }
    }

    /// Returns the record store.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.context.store
    }

    /// Returns the sites that sent a heartbeat.
    pub fn sites(&self) -> Vec<SiteStatus> {
        self.context.sites()
    }

    fn dispatch(&self, request: &HubRequest, now_ms: i64) -> ServerResult<HubResponse> {
        let route = route(request)?;
        if matches!(route, Route::Health) {
            return HubResponse::json(&json!({ "status": "ok" }));
        }

        let key_id = self.authenticate(request, now_ms)?;
        let now = DateTime::<Utc>::from_timestamp_millis(now_ms)
            .ok_or_else(|| ServerError::Internal(format!("clock out of range: {now_ms}")))?;

        match route {
            Route::Push => {
                HubResponse::json(&self.handler.handle_push(&key_id, &request.body, now)?)
            }
            Route::Pull => HubResponse::json(&self.handler.handle_pull(request.query(), now)?),
            Route::Heartbeat => {
                HubResponse::json(&self.handler.handle_heartbeat(&key_id, &request.body, now)?)
            }
            Route::Health => HubResponse::json(&json!({ "status": "ok" })),
        }
    }

    /// Verifies the signature and returns the key id that signed it.
    fn authenticate(&self, request: &HubRequest, now_ms: i64) -> ServerResult<String> {
        let headers = SignedHeaders::from_lookup(|name| request.header(name))?;
        self.verifier.verify(
            &headers,
            &request.method,
            &request.target,
            &request.body,
            now_ms,
        )?;
        Ok(headers.key_id)
    }
}

fn route(request: &HubRequest) -> ServerResult<Route> {
    let path = request.path();
    let route = match path {
        HEALTH_PATH => (Route::Health, "GET"),
        PUSH_PATH => (Route::Push, "POST"),
        PULL_PATH => (Route::Pull, "GET"),
        HEARTBEAT_PATH => (Route::Heartbeat, "POST"),
        _ => return Err(ServerError::NotFound(path.to_string())),
    };
    if !request.method.eq_ignore_ascii_case(route.1) {
        return Err(ServerError::MethodNotAllowed {
            method: request.method.clone(),
            path: path.to_string(),
        });
    }
    Ok(route.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_protocol::{
        EntityKind, PullQuery, PullResponse, PushRequest, PushResponse, RequestSigner,
        SyncAction, SyncEntity, SyncRecord, TIMESTAMP_HEADER,
    };

    const NOW: i64 = 1_714_557_600_000;

    fn server() -> SyncServer {
        SyncServer::new(
            ServerConfig::new()
                .with_key("site-1", b"one".to_vec())
                .with_key("site-2", b"two".to_vec()),
        )
    }

    fn signed(signer: &RequestSigner, method: &str, target: &str, body: Vec<u8>) -> HubRequest {
        let headers = signer.sign_at(NOW, method, target, &body);
        headers
            .pairs()
            .into_iter()
            .fold(HubRequest::new(method, target, body), |r, (n, v)| {
                r.with_header(n, v)
            })
    }

    fn push_body(site: &str, id: &str) -> Vec<u8> {
        serde_json::to_vec(&PushRequest::new(
            site,
            vec![SyncEntity::new(
                EntityKind::Door,
                SyncAction::Update,
                SyncRecord::new(id),
            )],
        ))
        .unwrap()
    }

    #[test]
    fn health_needs_no_signature() {
        let response = server().handle(&HubRequest::new("GET", "/health", Vec::new()), NOW);
        assert_eq!(response.status, 200);
    }

    #[test]
    fn unsigned_push_is_rejected() {
        let server = server();
        let response = server.handle(
            &HubRequest::new("POST", PUSH_PATH, push_body("site-1", "d1")),
            NOW,
        );
        assert_eq!(response.status, 401);
        assert!(server.store().is_empty());
    }

    #[test]
    fn signed_push_then_pull_from_other_site() {
        let server = server();
        let one = RequestSigner::new("site-1", b"one".to_vec());
        let two = RequestSigner::new("site-2", b"two".to_vec());

        let response = server.handle(
            &signed(&one, "POST", PUSH_PATH, push_body("site-1", "d1")),
            NOW,
        );
        assert_eq!(response.status, 200);
        let push: PushResponse = serde_json::from_slice(&response.body).unwrap();
        assert!(push.is_complete());

        let target = PullQuery::new("site-2", DateTime::UNIX_EPOCH).request_target();
        let response = server.handle(&signed(&two, "GET", &target, Vec::new()), NOW);
        assert_eq!(response.status, 200);
        let pull: PullResponse = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(pull.len(), 1);
    }

    #[test]
    fn tampered_body_is_rejected() {
        let server = server();
        let one = RequestSigner::new("site-1", b"one".to_vec());
        let mut request = signed(&one, "POST", PUSH_PATH, push_body("site-1", "d1"));
        request.body = push_body("site-1", "d2");

        assert_eq!(server.handle(&request, NOW).status, 401);
    }

    #[test]
    fn tampered_query_is_rejected() {
        let server = server();
        let one = RequestSigner::new("site-1", b"one".to_vec());
        let target = PullQuery::new("site-1", DateTime::UNIX_EPOCH).request_target();
        let mut request = signed(&one, "GET", &target, Vec::new());
        request.target = PullQuery::new("site-2", DateTime::UNIX_EPOCH).request_target();

        assert_eq!(server.handle(&request, NOW).status, 401);
    }

    #[test]
    fn push_as_another_site_is_forbidden() {
        let server = server();
        let one = RequestSigner::new("site-1", b"one".to_vec());
        let response = server.handle(
            &signed(&one, "POST", PUSH_PATH, push_body("site-2", "d1")),
            NOW,
        );
        assert_eq!(response.status, 403);
        assert!(server.store().is_empty());
    }

    #[test]
    fn extreme_timestamp_is_rejected() {
        let server = server();
        let one = RequestSigner::new("site-1", b"one".to_vec());
        let mut request = signed(&one, "POST", PUSH_PATH, push_body("site-1", "d1"));
        request
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(TIMESTAMP_HEADER));
        let request = request.with_header(TIMESTAMP_HEADER, i64::MIN.to_string());
        assert_eq!(server.handle(&request, NOW).status, 401);
    }

    #[test]
    fn stale_request_is_rejected() {
        let server = server();
        let one = RequestSigner::new("site-1", b"one".to_vec());
        let request = signed(&one, "POST", PUSH_PATH, push_body("site-1", "d1"));

        let later = NOW + 6 * 60 * 1000;
        assert_eq!(server.handle(&request, later).status, 401);
    }

    #[test]
    fn unknown_routes() {
        let server = server();
        assert_eq!(
            server
                .handle(&HubRequest::new("GET", "/nope", Vec::new()), NOW)
                .status,
            404
        );
        assert_eq!(
            server
                .handle(&HubRequest::new("DELETE", PUSH_PATH, Vec::new()), NOW)
                .status,
            405
        );
    }

    #[test]
    fn target_split() {
        let request = HubRequest::new("GET", "/sync/pull?siteId=a&since=x", Vec::new());
        assert_eq!(request.path(), "/sync/pull");
        assert_eq!(request.query(), "siteId=a&since=x");
        assert_eq!(HubRequest::new("GET", "/health", Vec::new()).query(), "");
    }
}
