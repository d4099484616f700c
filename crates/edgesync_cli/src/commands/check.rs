//! Health check command implementation.

use edgesync_engine::{MemoryLocalStore, SyncConfig, SyncEngine};
use std::error::Error;
use std::sync::Arc;

/// Runs one health round and prints the report as JSON.
///
/// Fails when the cloud did not answer, so scripts can rely on the exit code.
pub async fn run(config: SyncConfig) -> Result<(), Box<dyn Error>> {
    let engine = SyncEngine::connect(config, Arc::new(MemoryLocalStore::new()), Vec::new())?;
    let report = engine.health().check_once().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.shutdown().await?;

    if report.cloud_reachable == Some(false) {
        return Err("cloud unreachable".into());
    }
    Ok(())
}
