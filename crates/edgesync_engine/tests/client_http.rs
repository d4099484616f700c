//! SyncClient against a mock cloud over plain HTTP on loopback.

use chrono::{DateTime, Utc};
use edgesync_engine::{
    MemoryLocalStore, SyncClient, SyncConfig, SyncEngine, SyncError, SyncStatus, SyncTransport,
};
use edgesync_protocol::{
    EntityKind, HeartbeatRequest, OperatingMode, PullQuery, PushRequest, SignatureVerifier,
    SignedHeaders, SyncAction, SyncEntity, SyncRecord,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn config(base: &str) -> SyncConfig {
    SyncConfig::new("site-1", base, "secret").with_request_timeout(Duration::from_millis(500))
}

fn push_request() -> PushRequest {
    PushRequest::new(
        "site-1",
        vec![SyncEntity::new(
            EntityKind::Door,
            SyncAction::Update,
            SyncRecord::new("d1").with_field("locked", true),
        )],
    )
}

fn verify(request: &Request) -> Result<(), edgesync_protocol::AuthError> {
    let headers = SignedHeaders::from_lookup(|name| {
        request.headers.get(name).and_then(|v| v.to_str().ok())
    })?;
    let target = match request.url.query() {
        Some(query) => format!("{}?{}", request.url.path(), query),
        None => request.url.path().to_string(),
    };
    SignatureVerifier::new().with_key("site-1", b"secret".to_vec()).verify(
        &headers,
        request.method.as_str(),
        &target,
        &request.body,
        Utc::now().timestamp_millis(),
    )
}

#[tokio::test]
async fn push_is_signed_over_sent_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .and(header_exists("x-sync-signature"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "synced": 1,
            "errors": 0,
            "timestamp": "2024-05-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = SyncClient::new(&config(&server.uri())).unwrap();
    let response = client.push(&push_request()).await.unwrap();
    assert!(response.is_complete());

    let received = server.received_requests().await.unwrap();
    verify(&received[0]).unwrap();
    let sent: PushRequest = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent, push_request());
}

#[tokio::test]
async fn pull_signs_query_string() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .and(query_param("siteId", "site-1"))
        .and(query_param("entities", "door,config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "doors": [{ "id": "d1", "locked": false }], "configs": [] },
            "timestamp": "2024-05-01T10:00:00Z"
        })))
        .mount(&server)
        .await;

    let client = SyncClient::new(&config(&server.uri())).unwrap();
    let query = PullQuery::new("site-1", DateTime::UNIX_EPOCH)
        .with_entities(vec![EntityKind::Door, EntityKind::Config]);
    let response = client.pull(&query).await.unwrap();
    assert_eq!(response.len(), 1);

    let received = server.received_requests().await.unwrap();
    assert!(received[0].body.is_empty());
    verify(&received[0]).unwrap();
}

#[tokio::test]
async fn base_path_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/sync/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ack": true,
            "timestamp": "2024-05-01T10:00:00Z",
            "upgrade": { "targetVersion": "1.2.0", "action": "upgrade" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let base = format!("{}/api/v1", server.uri());
    let client = SyncClient::new(&config(&base)).unwrap();
    let beat = HeartbeatRequest::new("site-1", OperatingMode::Edge, 0);
    let response = client.heartbeat(&beat).await.unwrap();
    assert!(response.ack);
    assert_eq!(response.upgrade.unwrap().target_version, "1.2.0");

    let received = server.received_requests().await.unwrap();
    verify(&received[0]).unwrap();
}

#[tokio::test]
async fn error_statuses_are_typed() {
    let server = MockServer::start().await;
    Mock::given(path("/sync/push"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad signature"))
        .mount(&server)
        .await;
    Mock::given(path("/sync/heartbeat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = SyncClient::new(&config(&server.uri())).unwrap();

    let err = client.push(&push_request()).await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: 401, ref body } if body == "bad signature"));
    assert!(err.is_client_error());
    assert!(!err.is_retryable());

    let beat = HeartbeatRequest::new("site-1", OperatingMode::Edge, 0);
    let err = client.heartbeat(&beat).await.unwrap_err();
    assert!(err.is_server_error());
    assert!(err.is_retryable());
}

#[tokio::test]
async fn malformed_body_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let client = SyncClient::new(&config(&server.uri())).unwrap();
    let err = client.push(&push_request()).await.unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
}

#[tokio::test]
async fn slow_cloud_times_out() {
    let server = MockServer::start().await;
    Mock::given(path("/sync/push"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "synced": 1, "errors": 0, "timestamp": "2024-05-01T10:00:00Z" }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let client = SyncClient::new(&config(&server.uri())).unwrap();
    let err = client.push(&push_request()).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_retryable());
}

#[tokio::test]
async fn health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let client = SyncClient::new(&config(&server.uri())).unwrap();
    client.check_health().await.unwrap();

    let err = client.check_health().await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: 404, .. }));
}

#[tokio::test]
async fn refused_connection_is_retryable() {
    let client = SyncClient::new(&config("http://127.0.0.1:9")).unwrap();
    let err = client.check_health().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!err.is_security_event());
}

#[tokio::test]
async fn engine_tick_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "synced": 1, "errors": 0, "timestamp": "2024-05-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "alerts": [{ "id": "a1", "severity": "high" }] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ack": true, "timestamp": "2024-05-01T10:00:00Z"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryLocalStore::new());
    let engine = SyncEngine::connect(config(&server.uri()), store.clone(), Vec::new()).unwrap();
    engine
        .track_change(SyncEntity::new(
            EntityKind::Door,
            SyncAction::Update,
            SyncRecord::new("d1"),
        ))
        .unwrap();

    engine.tick().await.unwrap();

    assert_eq!(engine.status(), SyncStatus::Synced);
    assert!(store.get(&EntityKind::Alert, "a1").is_some());
    for request in server.received_requests().await.unwrap() {
        verify(&request).unwrap();
    }
}
