//! Drain command implementation.

use edgesync_engine::{MemoryLocalStore, SyncConfig, SyncEngine};
use std::error::Error;
use std::sync::Arc;
use tracing::info;

/// Delivers the offline queue now.
///
/// The CLI has no access to the business store, so records pulled after the
/// drain are counted but not kept.
pub async fn run(config: SyncConfig) -> Result<(), Box<dyn Error>> {
    if config.queue_path.is_none() {
        return Err("queue_path is not set".into());
    }

    let engine = SyncEngine::connect(config, Arc::new(MemoryLocalStore::new()), Vec::new())?;
    let report = engine.health().check_once().await;
    if !report.mode.is_connected() {
        engine.shutdown().await?;
        return Err("cloud unreachable, queue left untouched".into());
    }

    let result = engine.drain_queue().await;
    let remaining = engine.queue().stats();
    engine.shutdown().await?;

    let drained = result?;
    info!(drained, "drain finished");
    println!(
        "drained {drained} changes, {} still queued ({} failed)",
        remaining.outstanding(),
        remaining.failed
    );
    Ok(())
}
