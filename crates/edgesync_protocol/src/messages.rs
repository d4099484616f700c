//! Request and response bodies of the sync endpoints.

use crate::entity::{EntityKind, SyncEntity, SyncRecord};
use crate::error::{ProtocolError, ProtocolResult};
use crate::mode::OperatingMode;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Push endpoint path.
pub const PUSH_PATH: &str = "/sync/push";
/// Pull endpoint path.
pub const PULL_PATH: &str = "/sync/pull";
/// Heartbeat endpoint path.
pub const HEARTBEAT_PATH: &str = "/sync/heartbeat";
/// Unauthenticated liveness probe path.
pub const HEALTH_PATH: &str = "/health";

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Originating site.
    pub site_id: String,
    /// Changes in the order they were made.
    pub entities: Vec<SyncEntity>,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(site_id: impl Into<String>, entities: Vec<SyncEntity>) -> Self {
        Self {
            site_id: site_id.into(),
            entities,
        }
    }
}

/// Response to a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Entities accepted by the cloud.
    pub synced: u32,
    /// Entities the cloud failed to apply.
    pub errors: u32,
    /// Cloud clock at response time.
    pub timestamp: DateTime<Utc>,
}

impl PushResponse {
    /// Creates a response acknowledging every entity.
    pub fn success(synced: u32) -> Self {
        Self {
            synced,
            errors: 0,
            timestamp: Utc::now(),
        }
    }

    /// Returns true if no entity was rejected.
    pub fn is_complete(&self) -> bool {
        self.errors == 0
    }
}

/// Query of `GET /sync/pull`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullQuery {
    /// Requesting site.
    pub site_id: String,
    /// Only changes after this instant.
    pub since: DateTime<Utc>,
    /// Optional type filter.
    pub entities: Option<Vec<EntityKind>>,
}

impl PullQuery {
    /// Creates a new pull query.
    pub fn new(site_id: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self {
            site_id: site_id.into(),
            since,
            entities: None,
        }
    }

    /// Restricts the pull to the given entity types.
    pub fn with_entities(mut self, entities: Vec<EntityKind>) -> Self {
        self.entities = Some(entities);
        self
    }

    /// Encodes the query string (without the leading `?`).
    pub fn to_query_string(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("siteId", &self.site_id);
        query.append_pair(
            "since",
            &self.since.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        if let Some(entities) = self.entities.as_ref().filter(|e| !e.is_empty()) {
            let names: Vec<&str> = entities.iter().map(EntityKind::name).collect();
            query.append_pair("entities", &names.join(","));
        }
        query.finish()
    }

    /// Returns the request target including the query string.
    pub fn request_target(&self) -> String {
        format!("{}?{}", PULL_PATH, self.to_query_string())
    }

    /// Parses a query string produced by [`PullQuery::to_query_string`].
    pub fn parse(query: &str) -> ProtocolResult<Self> {
        let mut site_id = None;
        let mut since = None;
        let mut entities = None;

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "siteId" => site_id = Some(value.into_owned()),
                "since" => {
                    let parsed = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                        ProtocolError::MalformedQuery(format!("since={value}: {e}"))
                    })?;
                    since = Some(parsed.with_timezone(&Utc));
                }
                "entities" => {
                    entities = Some(
                        value
                            .split(',')
                            .filter(|s| !s.is_empty())
                            .map(EntityKind::from)
                            .collect(),
                    );
                }
                _ => {}
            }
        }

        Ok(Self {
            site_id: site_id
                .ok_or_else(|| ProtocolError::MalformedQuery("missing siteId".into()))?,
            since: since.unwrap_or(DateTime::UNIX_EPOCH),
            entities,
        })
    }
}

/// Response to a pull: records grouped by plural entity key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Raw records keyed by plural type name (`doors`, `alerts`, ...).
    pub data: BTreeMap<String, Vec<Value>>,
    /// Cloud clock at response time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// A validated record from a pull response.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledRecord {
    /// Entity type.
    pub kind: EntityKind,
    /// Remote version of the record.
    pub record: SyncRecord,
}

impl PullResponse {
    /// Creates a response from validated records.
    pub fn from_records(records: impl IntoIterator<Item = (EntityKind, SyncRecord)>) -> Self {
        let mut data: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (kind, record) in records {
            data.entry(kind.plural()).or_default().push(record.into_value());
        }
        Self {
            data,
            timestamp: Some(Utc::now()),
        }
    }

    /// Returns the number of raw records.
    pub fn len(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    /// Returns true if the response carries no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validates every record, separating the rejects.
    ///
    /// A single malformed record never poisons the rest of the batch.
    pub fn into_records(self) -> (Vec<PulledRecord>, Vec<ProtocolError>) {
        let mut records = Vec::new();
        let mut rejected = Vec::new();

        for (key, values) in self.data {
            let kind = EntityKind::from_plural(&key);
            for value in values {
                match SyncRecord::from_value(value) {
                    Ok(record) => records.push(PulledRecord {
                        kind: kind.clone(),
                        record,
                    }),
                    Err(e) => rejected.push(e),
                }
            }
        }

        (records, rejected)
    }
}

/// Body of `POST /sync/heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// Reporting site.
    pub site_id: String,
    /// Current operating mode.
    pub mode: OperatingMode,
    /// Changes not yet acknowledged by the cloud.
    pub pending_changes: usize,
    /// Agent version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    /// Seconds since the agent started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Queued rows currently marked failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_changes: Option<usize>,
}

impl HeartbeatRequest {
    /// Creates a heartbeat without telemetry.
    pub fn new(site_id: impl Into<String>, mode: OperatingMode, pending_changes: usize) -> Self {
        Self {
            site_id: site_id.into(),
            mode,
            pending_changes,
            agent_version: None,
            uptime_secs: None,
            failed_changes: None,
        }
    }
}

/// Self-update instruction sent by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCommand {
    /// Version to move to.
    pub target_version: String,
    /// Requested action (for example `upgrade` or `rollback`).
    pub action: String,
}

/// A sibling site advertised by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Sibling site id.
    pub site_id: String,
    /// Address at which the sibling can be reached.
    #[serde(default)]
    pub address: Option<String>,
    /// Fields this agent does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Response to a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// Whether the cloud recorded the heartbeat.
    pub ack: bool,
    /// Cloud clock at response time.
    pub timestamp: DateTime<Utc>,
    /// Optional self-update command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeCommand>,
    /// Optional sibling sites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerInfo>>,
}

impl HeartbeatResponse {
    /// Creates a plain acknowledgement.
    pub fn ack() -> Self {
        Self {
            ack: true,
            timestamp: Utc::now(),
            upgrade: None,
            peers: None,
        }
    }
}
