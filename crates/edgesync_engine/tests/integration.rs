//! Engine and reference hub wired through the signing loopback transport.

use chrono::Utc;
use edgesync_engine::{
    LoopbackServer, LoopbackTransport, MemoryLocalStore, SyncConfig, SyncEngine, SyncError,
    SyncStatus, WireRequest, WireResponse,
};
use edgesync_protocol::{
    EntityKind, OperatingMode, SyncAction, SyncEntity, SyncRecord, UpgradeCommand,
};
use edgesync_server::{HubRequest, ServerConfig, SyncServer, HUB_ORIGIN};
use std::sync::Arc;

#[derive(Clone)]
struct Hub(Arc<SyncServer>);

impl LoopbackServer for Hub {
    fn handle(&self, request: &WireRequest) -> WireResponse {
        let hub_request = HubRequest {
            method: request.method.to_string(),
            target: request.target.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        let response = self.0.handle(&hub_request, Utc::now().timestamp_millis());
        WireResponse {
            status: response.status,
            body: response.body,
        }
    }
}

fn hub(config: ServerConfig) -> Hub {
    Hub(Arc::new(SyncServer::new(
        config
            .with_key("site-1", b"secret-one".to_vec())
            .with_key("site-2", b"secret-two".to_vec()),
    )))
}

struct Site {
    engine: SyncEngine,
    transport: Arc<LoopbackTransport<Hub>>,
    store: Arc<MemoryLocalStore>,
}

fn site(hub: &Hub, site_id: &str, key: &str) -> Site {
    let config = SyncConfig::new(site_id, "https://cloud.example", key).with_mode_flip_threshold(1);
    let transport = Arc::new(LoopbackTransport::new(hub.clone(), &config));
    let store = Arc::new(MemoryLocalStore::new());
    let engine = SyncEngine::new(config, transport.clone(), store.clone(), Vec::new()).unwrap();
    Site {
        engine,
        transport,
        store,
    }
}

fn door(id: &str, action: SyncAction, locked: bool) -> SyncEntity {
    SyncEntity::new(
        EntityKind::Door,
        action,
        SyncRecord::new(id)
            .with_updated_at(Utc::now())
            .with_field("locked", locked),
    )
}

#[tokio::test]
async fn change_reaches_other_site() {
    let hub = hub(ServerConfig::new());
    let one = site(&hub, "site-1", "secret-one");
    let two = site(&hub, "site-2", "secret-two");

    one.engine
        .track_change(door("d1", SyncAction::Update, true))
        .unwrap();
    one.engine.tick().await.unwrap();
    assert_eq!(one.engine.status(), SyncStatus::Synced);
    assert!(hub.0.store().get(&EntityKind::Door, "d1").is_some());
    assert_eq!(one.store.applied_count(), 0);

    two.engine.tick().await.unwrap();
    let pulled = two.store.get(&EntityKind::Door, "d1").unwrap();
    assert_eq!(pulled.get("locked"), Some(&serde_json::json!(true)));
    assert_eq!(two.engine.stats().applied, 1);
}

#[tokio::test]
async fn offline_changes_drain_in_order() {
    let hub = hub(ServerConfig::new());
    let one = site(&hub, "site-1", "secret-one");

    one.transport.set_reachable(false);
    one.engine.health().check_once().await;
    assert_eq!(one.engine.get_operating_mode(), OperatingMode::Standalone);

    one.engine
        .track_change(door("d1", SyncAction::Update, true))
        .unwrap();
    one.engine
        .track_change(door("d1", SyncAction::Delete, true))
        .unwrap();
    assert_eq!(one.engine.get_sync_state().pending_changes, 2);

    one.transport.set_reachable(true);
    one.engine.health().check_once().await;
    assert_eq!(one.engine.get_operating_mode(), OperatingMode::Edge);

    assert_eq!(one.engine.drain_queue().await.unwrap(), 2);
    assert!(hub.0.store().is_deleted(&EntityKind::Door, "d1"));
    assert_eq!(one.engine.get_sync_state().pending_changes, 0);
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let hub = hub(ServerConfig::new());
    let rogue = site(&hub, "site-1", "not-the-secret");
    rogue
        .engine
        .track_change(door("d1", SyncAction::Update, true))
        .unwrap();

    let err = rogue.engine.tick().await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: 401, .. }));
    assert!(err.is_client_error());
    assert!(hub.0.store().is_empty());

    let state = rogue.engine.get_sync_state();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.pending_changes, 1);
}

#[tokio::test]
async fn heartbeat_reports_site_and_receives_upgrade() {
    let hub = hub(ServerConfig::new().with_upgrade(UpgradeCommand {
        target_version: "99.0.0".into(),
        action: "upgrade".into(),
    }));
    let one = site(&hub, "site-1", "secret-one");

    one.engine.tick().await.unwrap();

    let beat = one.engine.last_heartbeat().unwrap();
    assert!(beat.ack);
    assert_eq!(beat.upgrade.unwrap().target_version, "99.0.0");

    let sites = hub.0.sites();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].site_id, "site-1");
    assert_eq!(sites[0].mode, OperatingMode::Edge);
}

#[tokio::test]
async fn cloud_authored_config_overrides_local() {
    let hub = hub(ServerConfig::new());
    let one = site(&hub, "site-1", "secret-one");

    let now = Utc::now();
    one.store.insert(
        EntityKind::Config,
        SyncRecord::new("global")
            .with_updated_at(now)
            .with_field("lockdown", false),
    );
    hub.0.store().put(
        EntityKind::Config,
        SyncRecord::new("global")
            .with_updated_at(now - chrono::Duration::minutes(1))
            .with_field("lockdown", true),
        HUB_ORIGIN,
        now,
    );

    let summary = one.engine.sync_from_cloud().await.unwrap();
    assert_eq!(summary.applied, 1);
    let local = one.store.get(&EntityKind::Config, "global").unwrap();
    assert_eq!(local.get("lockdown"), Some(&serde_json::json!(true)));
}
