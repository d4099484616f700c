//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use edgesync_protocol::{
    HeartbeatRequest, HeartbeatResponse, OperatingMode, PeerInfo, PullQuery, PullResponse,
    PushResponse, SyncEntity,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last heartbeat seen from a site.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatus {
    /// Site identifier.
    pub site_id: String,
    /// Reported operating mode.
    pub mode: OperatingMode,
    /// Reported pending changes.
    pub pending_changes: usize,
    /// Reported failed queue rows.
    pub failed_changes: Option<usize>,
    /// Reported agent version.
    pub agent_version: Option<String>,
    /// Hub clock at the last heartbeat.
    pub last_seen: DateTime<Utc>,
}

/// Context for request handling.
pub struct HandlerContext {
    /// Hub configuration.
    pub config: ServerConfig,
    /// Record store (shared across all handlers).
    pub store: Arc<RecordStore>,
    sites: RwLock<HashMap<String, SiteStatus>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<RecordStore>) -> Self {
        Self {
            config,
            store,
            sites: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the known sites ordered by id.
    pub fn sites(&self) -> Vec<SiteStatus> {
        let mut sites: Vec<SiteStatus> = self.sites.read().values().cloned().collect();
        sites.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        sites
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a push body signed with `key_id`.
    ///
    /// Entities that fail to decode are counted in `errors` instead of
    /// failing the whole request.
    pub fn handle_push(
        &self,
        key_id: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> ServerResult<PushResponse> {
        let document: Value = serde_json::from_slice(body)?;
        let site_id = document
            .get("siteId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::InvalidRequest("missing siteId".into()))?;
        self.authorize(key_id, site_id)?;
        let entities = document
            .get("entities")
            .and_then(Value::as_array)
            .ok_or_else(|| ServerError::InvalidRequest("missing entities".into()))?;

        let max = self.context.config.max_push_batch;
        if entities.len() > max {
            return Err(ServerError::BatchTooLarge {
                count: entities.len(),
                max,
            });
        }

        let mut synced = 0u32;
        let mut errors = 0u32;
        for raw in entities {
            match serde_json::from_value::<SyncEntity>(raw.clone()) {
                Ok(entity) => {
                    self.context.store.apply(site_id, &entity, now);
                    synced += 1;
                }
                Err(e) => {
                    warn!(site_id, error = %e, "rejected pushed entity");
                    errors += 1;
                }
            }
        }

        debug!(site_id, synced, errors, "push handled");
        Ok(PushResponse {
            synced,
            errors,
            timestamp: now,
        })
    }

    /// Handles a pull query string.
    pub fn handle_pull(&self, query: &str, now: DateTime<Utc>) -> ServerResult<PullResponse> {
        let query = PullQuery::parse(query)?;
        let changes = self.context.store.changes_since(
            query.since,
            query.entities.as_deref(),
            &query.site_id,
        );

        debug!(site_id = %query.site_id, records = changes.len(), "pull handled");
        Ok(PullResponse {
            timestamp: Some(now),
            ..PullResponse::from_records(changes)
        })
    }

    /// Handles a heartbeat body signed with `key_id`.
    pub fn handle_heartbeat(
        &self,
        key_id: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> ServerResult<HeartbeatResponse> {
        let beat: HeartbeatRequest = serde_json::from_slice(body)?;
        if beat.site_id.is_empty() {
            return Err(ServerError::InvalidRequest("missing siteId".into()));
        }
        self.authorize(key_id, &beat.site_id)?;

        let status = SiteStatus {
            site_id: beat.site_id.clone(),
            mode: beat.mode,
            pending_changes: beat.pending_changes,
            failed_changes: beat.failed_changes,
            agent_version: beat.agent_version.clone(),
            last_seen: now,
        };
        let previous = self
            .context
            .sites
            .write()
            .insert(beat.site_id.clone(), status);
        if previous.map(|p| p.mode) != Some(beat.mode) {
            info!(site_id = %beat.site_id, mode = %beat.mode, "site mode reported");
        }

        let upgrade = self
            .context
            .config
            .upgrade
            .clone()
            .filter(|u| beat.agent_version.as_deref() != Some(u.target_version.as_str()));

        let peers = if self.context.config.advertise_peers {
            let peers: Vec<PeerInfo> = self
                .context
                .sites()
                .into_iter()
                .filter(|site| site.site_id != beat.site_id)
                .map(peer_info)
                .collect();
            Some(peers).filter(|p| !p.is_empty())
        } else {
            None
        };

        Ok(HeartbeatResponse {
            ack: true,
            timestamp: now,
            upgrade,
            peers,
        })
    }

    fn authorize(&self, key_id: &str, site_id: &str) -> ServerResult<()> {
        if self.context.config.site_for_key(key_id) == site_id {
            return Ok(());
        }
        warn!(key_id, site_id, "key used for another site");
        Err(ServerError::Forbidden {
            key_id: key_id.to_string(),
            site_id: site_id.to_string(),
        })
    }
}

fn peer_info(site: SiteStatus) -> PeerInfo {
    let mut extra = Map::new();
    extra.insert("mode".into(), Value::String(site.mode.to_string()));
    extra.insert(
        "lastSeen".into(),
        Value::String(site.last_seen.to_rfc3339()),
    );
    PeerInfo {
        site_id: site.site_id,
        address: None,
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_protocol::{
        EntityKind, PushRequest, SyncAction, SyncRecord, UpgradeCommand,
    };
    use serde_json::json;

    fn handler(config: ServerConfig) -> RequestHandler {
        let store = Arc::new(RecordStore::new());
        RequestHandler::new(Arc::new(HandlerContext::new(config, store)))
    }

    #[test]
    fn push_counts_bad_entities() {
        let handler = handler(ServerConfig::new());
        let body = json!({
            "siteId": "site-1",
            "entities": [
                {
                    "type": "door",
                    "action": "update",
                    "data": { "id": "d1", "locked": true },
                    "timestamp": "2024-05-01T10:00:00Z"
                },
                { "type": "door", "action": "explode", "data": { "id": "d2" }, "timestamp": "2024-05-01T10:00:00Z" },
                { "type": "door", "action": "update", "data": { "locked": true }, "timestamp": "2024-05-01T10:00:00Z" }
            ]
        });

        let response = handler
            .handle_push("site-1", body.to_string().as_bytes(), Utc::now())
            .unwrap();
        assert_eq!(response.synced, 1);
        assert_eq!(response.errors, 2);
        assert!(!response.is_complete());
    }

    #[test]
    fn push_requires_site() {
        let handler = handler(ServerConfig::new());
        let err = handler
            .handle_push("site-1", br#"{"entities": []}"#, Utc::now())
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn push_rejects_oversized_batch() {
        let handler = handler(ServerConfig::new().with_max_push_batch(1));
        let request = PushRequest::new(
            "site-1",
            vec![
                SyncEntity::new(EntityKind::Door, SyncAction::Update, SyncRecord::new("a")),
                SyncEntity::new(EntityKind::Door, SyncAction::Update, SyncRecord::new("b")),
            ],
        );
        let body = serde_json::to_vec(&request).unwrap();
        let err = handler.handle_push("site-1", &body, Utc::now()).unwrap_err();
        assert!(matches!(err, ServerError::BatchTooLarge { count: 2, max: 1 }));
    }

    #[test]
    fn pull_returns_other_sites_changes() {
        let handler = handler(ServerConfig::new());
        let request = PushRequest::new(
            "site-1",
            vec![SyncEntity::new(
                EntityKind::Alert,
                SyncAction::Create,
                SyncRecord::new("a1"),
            )],
        );
        handler
            .handle_push("site-1", &serde_json::to_vec(&request).unwrap(), Utc::now())
            .unwrap();

        let query = PullQuery::new("site-2", DateTime::UNIX_EPOCH).to_query_string();
        let response = handler.handle_pull(&query, Utc::now()).unwrap();
        assert_eq!(response.len(), 1);
        assert!(response.data.contains_key("alerts"));

        let own = PullQuery::new("site-1", DateTime::UNIX_EPOCH).to_query_string();
        assert!(handler.handle_pull(&own, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn key_cannot_write_as_another_site() {
        let handler = handler(ServerConfig::new().with_site_key("k-9", "site-2", b"k".to_vec()));
        let request = PushRequest::new(
            "site-2",
            vec![SyncEntity::new(EntityKind::Door, SyncAction::Update, SyncRecord::new("d1"))],
        );
        let body = serde_json::to_vec(&request).unwrap();

        let err = handler.handle_push("site-1", &body, Utc::now()).unwrap_err();
        assert!(matches!(err, ServerError::Forbidden { .. }));
        assert_eq!(err.status_code(), 403);
        assert!(handler.context.store.is_empty());

        assert_eq!(handler.handle_push("k-9", &body, Utc::now()).unwrap().synced, 1);

        let beat = HeartbeatRequest::new("site-2", OperatingMode::Edge, 0);
        let err = handler
            .handle_heartbeat("site-1", &serde_json::to_vec(&beat).unwrap(), Utc::now())
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(handler.context.sites().is_empty());
    }

    #[test]
    fn pull_rejects_bad_query() {
        let handler = handler(ServerConfig::new());
        let err = handler.handle_pull("since=yesterday", Utc::now()).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn heartbeat_records_site_and_offers_upgrade() {
        let upgrade = UpgradeCommand {
            target_version: "2.0.0".into(),
            action: "upgrade".into(),
        };
        let handler = handler(ServerConfig::new().with_upgrade(upgrade.clone()).with_peers(true));

        let mut beat = HeartbeatRequest::new("site-1", OperatingMode::Edge, 4);
        beat.agent_version = Some("1.0.0".into());
        let response = handler
            .handle_heartbeat("site-1", &serde_json::to_vec(&beat).unwrap(), Utc::now())
            .unwrap();
        assert!(response.ack);
        assert_eq!(response.upgrade, Some(upgrade));
        assert!(response.peers.is_none());

        let mut current = HeartbeatRequest::new("site-2", OperatingMode::Standalone, 0);
        current.agent_version = Some("2.0.0".into());
        let response = handler
            .handle_heartbeat("site-2", &serde_json::to_vec(&current).unwrap(), Utc::now())
            .unwrap();
        assert!(response.upgrade.is_none());
        let peers = response.peers.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].site_id, "site-1");
        assert_eq!(peers[0].extra.get("mode"), Some(&json!("EDGE")));

        let sites = handler.context.sites();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].pending_changes, 4);
    }
}
