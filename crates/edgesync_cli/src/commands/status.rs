//! Status command implementation.

use edgesync_engine::{MemoryLocalStore, SyncConfig, SyncEngine};
use std::error::Error;
use std::sync::Arc;

/// Probes the cloud once and prints the resulting sync state as JSON.
pub async fn run(config: SyncConfig) -> Result<(), Box<dyn Error>> {
    let engine = SyncEngine::connect(config, Arc::new(MemoryLocalStore::new()), Vec::new())?;
    engine.health().check_once().await;

    let state = engine.get_sync_state();
    println!("{}", serde_json::to_string_pretty(&state)?);

    engine.shutdown().await?;
    Ok(())
}
