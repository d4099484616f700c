//! Replicated entities and the validated record envelope.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The type of a replicated entity.
///
/// Known safety-platform types get their own variant so conflict policy can be
/// matched exhaustively. Unknown names survive as [`EntityKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    /// Safety alert.
    Alert,
    /// Door status.
    Door,
    /// Visitor log entry.
    Visitor,
    /// Global configuration.
    Config,
    /// Site record.
    Site,
    /// User record.
    User,
    /// Any other entity type.
    Other(String),
}

impl EntityKind {
    /// Returns the singular wire name.
    pub fn name(&self) -> &str {
        match self {
            EntityKind::Alert => "alert",
            EntityKind::Door => "door",
            EntityKind::Visitor => "visitor",
            EntityKind::Config => "config",
            EntityKind::Site => "site",
            EntityKind::User => "user",
            EntityKind::Other(name) => name,
        }
    }

    /// Returns the plural key used in pull responses: the name plus `s`,
    /// even when the name already ends in `s`.
    pub fn plural(&self) -> String {
        format!("{}s", self.name())
    }

    /// Parses a plural pull-response key back into a kind by dropping one
    /// trailing `s`.
    pub fn from_plural(key: &str) -> Self {
        let singular = key.strip_suffix('s').unwrap_or(key);
        Self::from(singular.to_string())
    }
}

impl From<String> for EntityKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "alert" => EntityKind::Alert,
            "door" => EntityKind::Door,
            "visitor" => EntityKind::Visitor,
            "config" => EntityKind::Config,
            "site" => EntityKind::Site,
            "user" => EntityKind::User,
            _ => EntityKind::Other(name),
        }
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kind of mutation carried by a [`SyncEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// A new record.
    Create,
    /// A changed record.
    Update,
    /// A removed record.
    Delete,
}

impl SyncAction {
    /// Returns the wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            _ => Err(ProtocolError::UnknownAction(s.to_string())),
        }
    }
}

/// A replicated record, validated at the boundary.
///
/// The wire format is a generic JSON document. Construction guarantees an
/// `id` and extracts the arbitration metadata (`updatedAt`, `authoritative`)
/// so resolution logic never touches untyped fields. The full document is
/// kept verbatim and is what gets serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct SyncRecord {
    id: String,
    updated_at: Option<DateTime<Utc>>,
    authoritative: bool,
    fields: Map<String, Value>,
}

impl SyncRecord {
    /// Creates a record with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut fields = Map::new();
        fields.insert("id".into(), Value::String(id.clone()));
        Self {
            id,
            updated_at: None,
            authoritative: false,
            fields,
        }
    }

    /// Sets the last-modified instant.
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.fields
            .insert("updatedAt".into(), Value::String(at.to_rfc3339()));
        self.updated_at = Some(at);
        self
    }

    /// Sets the authoritative-origin flag.
    pub fn with_authoritative(mut self, authoritative: bool) -> Self {
        self.fields
            .insert("authoritative".into(), Value::Bool(authoritative));
        self.authoritative = authoritative;
        self
    }

    /// Sets an arbitrary payload field.
    ///
    /// Metadata fields (`id`, `updatedAt`, `authoritative`) must be set through
    /// their dedicated builders; this call ignores them.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !is_metadata_key(&key) {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Validates a JSON document into a record.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        let Value::Object(fields) = value else {
            return Err(ProtocolError::InvalidRecord(
                "record must be a JSON object".into(),
            ));
        };

        let id = match fields.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(ProtocolError::InvalidRecord("id must be a string or number".into())),
            None => return Err(ProtocolError::InvalidRecord("missing id".into())),
        };

        let updated_at = match fields.get("updatedAt").or_else(|| fields.get("updated_at")) {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_instant(value)?),
        };

        let authoritative = match fields.get("authoritative") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ProtocolError::InvalidRecord(
                    "authoritative must be a boolean".into(),
                ))
            }
        };

        Ok(Self {
            id,
            updated_at,
            authoritative,
            fields,
        })
    }

    /// Returns the record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the last-modified instant, if the record carries one.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Returns true if the record claims authoritative origin.
    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Returns a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns the complete document.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consumes the record into its JSON document.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

fn is_metadata_key(key: &str) -> bool {
    matches!(key, "id" | "updatedAt" | "updated_at" | "authoritative")
}

fn parse_instant(value: &Value) -> ProtocolResult<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ProtocolError::InvalidRecord(format!("bad updatedAt {s:?}: {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ProtocolError::InvalidRecord(format!("bad updatedAt {n}"))),
        other => Err(ProtocolError::InvalidRecord(format!(
            "updatedAt must be a string or number, got {other}"
        ))),
    }
}

impl TryFrom<Value> for SyncRecord {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<SyncRecord> for Value {
    fn from(record: SyncRecord) -> Self {
        record.into_value()
    }
}

/// A unit of change to replicate.
///
/// Produced by the business layer and immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntity {
    #[serde(rename = "type")]
    entity_type: EntityKind,
    action: SyncAction,
    data: SyncRecord,
    timestamp: DateTime<Utc>,
}

impl SyncEntity {
    /// Creates an entity stamped with the current time.
    pub fn new(entity_type: impl Into<EntityKind>, action: SyncAction, data: SyncRecord) -> Self {
        Self::at(entity_type, action, data, Utc::now())
    }

    /// Creates an entity with an explicit timestamp.
    pub fn at(
        entity_type: impl Into<EntityKind>,
        action: SyncAction,
        data: SyncRecord,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            action,
            data,
            timestamp,
        }
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &EntityKind {
        &self.entity_type
    }

    /// Returns the mutation kind.
    pub fn action(&self) -> SyncAction {
        self.action
    }

    /// Returns the record payload.
    pub fn data(&self) -> &SyncRecord {
        &self.data
    }

    /// Returns when the change was made.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
