//! Pull command implementation.

use chrono::{DateTime, Utc};
use edgesync_engine::{SyncClient, SyncConfig, SyncTransport};
use edgesync_protocol::{EntityKind, PullQuery};
use std::error::Error;

/// Fetches cloud changes since `since` and prints them without applying.
pub async fn run(
    config: SyncConfig,
    since: Option<&str>,
    entities: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let since = match since {
        Some(raw) => parse_since(raw)?,
        None => DateTime::UNIX_EPOCH,
    };
    let entities: Option<Vec<EntityKind>> = entities
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(EntityKind::from)
                .collect()
        })
        .or_else(|| config.pull_entities.clone());

    let mut query = PullQuery::new(config.site_id.clone(), since);
    if let Some(entities) = entities {
        query = query.with_entities(entities);
    }

    let client = SyncClient::new(&config)?;
    let response = client.pull(&query).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Parses an RFC 3339 instant.
pub fn parse_since(raw: &str) -> Result<DateTime<Utc>, Box<dyn Error>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("--since {raw:?} is not an RFC 3339 instant: {e}"))?;
    Ok(parsed.with_timezone(&Utc))
}
