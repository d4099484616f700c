//! The sync engine: buffering, ticking, draining and reconciliation.

use crate::client::SyncClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::health::{HealthCheck, HealthEvent, HealthMonitor};
use crate::store::LocalStore;
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use edgesync_protocol::{
    resolve_conflict, EntityKind, HeartbeatRequest, HeartbeatResponse, OperatingMode,
    PullQuery, PulledRecord, PushRequest, SyncEntity, SyncRecord,
};
use edgesync_queue::{OfflineQueue, QueuedOperation};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No tick has run yet.
    Idle,
    /// A tick or drain is in progress.
    Syncing,
    /// The last tick succeeded.
    Synced,
    /// The last tick failed, or a local dependency is unhealthy.
    Error,
    /// The cloud link is down; changes go to the offline queue.
    Standalone,
}

/// Read-only summary of the engine, derived on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Site identifier.
    pub site_id: String,
    /// Engine status.
    pub status: SyncStatus,
    /// Start of the last successful tick.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Whether the cloud is considered reachable.
    pub cloud_reachable: bool,
    /// Mode in effect.
    pub operating_mode: OperatingMode,
    /// Buffered changes plus undelivered queue rows.
    pub pending_changes: usize,
    /// Queue rows whose last push attempt failed.
    pub failed_changes: usize,
    /// Message of the last failure, cleared by the next success.
    pub last_error: Option<String>,
}

/// Counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Ticks run.
    pub ticks: u64,
    /// Entities acknowledged by the cloud.
    pub pushed: u64,
    /// Valid records received from the cloud.
    pub pulled: u64,
    /// Records written to the local store.
    pub applied: u64,
    /// Pulled records that lost to the local copy.
    pub conflicts_kept_local: u64,
    /// Queue rows delivered by drains.
    pub drained: u64,
    /// Failed ticks and drains.
    pub failures: u64,
}

/// Outcome of one pull-and-resolve pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    /// Valid records received.
    pub pulled: usize,
    /// Records written locally.
    pub applied: usize,
    /// Records where the local copy won.
    pub kept_local: usize,
    /// Records identical to the local copy.
    pub unchanged: usize,
    /// Malformed records skipped.
    pub rejected: usize,
}

type StatusListener = Arc<dyn Fn(SyncStatus) + Send + Sync>;

#[derive(Debug, Default)]
struct Checkpoint {
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_heartbeat: Option<HeartbeatResponse>,
}

struct Core {
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    queue: Arc<OfflineQueue>,
    store: Arc<dyn LocalStore>,
    monitor: Arc<HealthMonitor>,
    buffer: Mutex<Vec<SyncEntity>>,
    status: RwLock<SyncStatus>,
    checkpoint: RwLock<Checkpoint>,
    stats: Mutex<SyncStats>,
    listeners: RwLock<Vec<StatusListener>>,
    /// Held for the duration of a tick or drain; ticks never interleave.
    cycle: tokio::sync::Mutex<()>,
    started: Instant,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Keeps a site's local state consistent with the cloud.
///
/// Local mutations are reported through [`SyncEngine::track_change`]. While
/// the cloud is reachable they are buffered in memory and pushed on the next
/// tick; while it is not they go straight to the durable offline queue.
pub struct SyncEngine {
    core: Arc<Core>,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    /// Creates an engine over an explicit transport.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn LocalStore>,
        checks: Vec<Arc<dyn HealthCheck>>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let queue = match &config.queue_path {
            Some(path) => OfflineQueue::open(path)?,
            None => OfflineQueue::in_memory(),
        };
        let monitor = HealthMonitor::new(
            config.role,
            checks,
            Arc::clone(&transport),
            config.mode_flip_threshold,
            config.health_check_interval,
        )
        .with_probe_timeout(config.request_timeout);

        Ok(Self {
            core: Arc::new(Core {
                config,
                transport,
                queue: Arc::new(queue),
                store,
                monitor: Arc::new(monitor),
                buffer: Mutex::new(Vec::new()),
                status: RwLock::new(SyncStatus::Idle),
                checkpoint: RwLock::new(Checkpoint::default()),
                stats: Mutex::new(SyncStats::default()),
                listeners: RwLock::new(Vec::new()),
                cycle: tokio::sync::Mutex::new(()),
                started: Instant::now(),
            }),
            running: Mutex::new(None),
        })
    }

    /// Creates an engine talking HTTPS to `config.cloud_url`.
    pub fn connect(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        checks: Vec<Arc<dyn HealthCheck>>,
    ) -> SyncResult<Self> {
        let client = SyncClient::new(&config)?;
        Self::new(config, Arc::new(client), store, checks)
    }

    /// Starts health monitoring and the tick loop on the current runtime.
    ///
    /// Calling `start` on a running engine does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let events = self.core.monitor.subscribe();
        tracker.spawn(Arc::clone(&self.core.monitor).run(cancel.child_token()));
        tracker.spawn(Arc::clone(&self.core).run(events, cancel.child_token()));
        tracker.close();

        info!(
            site_id = %self.core.config.site_id,
            role = %self.core.config.role,
            "sync engine started"
        );
        *running = Some(Running { cancel, tracker });
    }

    /// Stops both loops. An in-flight tick runs to completion first.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, tracker }) = running {
            cancel.cancel();
            tracker.wait().await;
            info!(site_id = %self.core.config.site_id, "sync engine stopped");
        }
    }

    /// Stops the engine, persists buffered changes and closes the queue.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.stop().await;
        let _cycle = self.core.cycle.lock().await;
        let moved = self.core.spill_buffer()?;
        if moved > 0 {
            info!(count = moved, "buffered changes persisted on shutdown");
        }
        self.core.queue.close()?;
        Ok(())
    }

    /// Reports a local mutation. Never waits on the network.
    ///
    /// In STANDALONE mode the change is written to the offline queue before
    /// this returns. If that write fails the change is kept in memory and the
    /// error is returned.
    pub fn track_change(&self, entity: SyncEntity) -> SyncResult<()> {
        let core = &self.core;
        if core.config.role == OperatingMode::Cloud {
            debug!(entity = %entity.entity_type(), "cloud role does not track changes");
            return Ok(());
        }

        if core.monitor.current_mode() == OperatingMode::Standalone {
            if let Err(e) = core.enqueue_entity(&entity) {
                core.buffer.lock().push(entity);
                core.record_failure(&e);
                return Err(e);
            }
            return Ok(());
        }

        core.buffer.lock().push(entity);
        Ok(())
    }

    /// Registers a callback invoked on every status change.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(SyncStatus) + Send + Sync + 'static,
    {
        self.core.listeners.write().push(Arc::new(callback));
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        *self.core.status.read()
    }

    /// Returns the operator-facing summary.
    pub fn get_sync_state(&self) -> SyncState {
        let core = &self.core;
        let queue = core.queue.stats();
        let buffered = core.buffer.lock().len();
        let mode = core.monitor.current_mode();
        let checkpoint = core.checkpoint.read();
        SyncState {
            site_id: core.config.site_id.clone(),
            status: self.status(),
            last_sync_at: checkpoint.last_sync_at,
            cloud_reachable: mode.is_connected(),
            operating_mode: mode,
            pending_changes: buffered + queue.outstanding(),
            failed_changes: queue.failed,
            last_error: checkpoint.last_error.clone(),
        }
    }

    /// Returns the mode in effect.
    pub fn get_operating_mode(&self) -> OperatingMode {
        self.core.monitor.current_mode()
    }

    /// Returns engine counters.
    pub fn stats(&self) -> SyncStats {
        *self.core.stats.lock()
    }

    /// Returns the last heartbeat response, including any pass-through
    /// upgrade command or peer list.
    pub fn last_heartbeat(&self) -> Option<HeartbeatResponse> {
        self.core.checkpoint.read().last_heartbeat.clone()
    }

    /// Returns the health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.core.monitor
    }

    /// Returns the offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.core.queue
    }

    /// Runs one tick now, waiting for any tick already in progress.
    pub async fn tick(&self) -> SyncResult<()> {
        let _cycle = self.core.cycle.lock().await;
        self.core.run_tick().await
    }

    /// Drains the offline queue, then pulls. Returns the rows delivered.
    pub async fn drain_queue(&self) -> SyncResult<usize> {
        let _cycle = self.core.cycle.lock().await;
        self.core.run_drain().await
    }

    /// Pulls and resolves remote changes without moving the checkpoint.
    pub async fn sync_from_cloud(&self) -> SyncResult<PullSummary> {
        let _cycle = self.core.cycle.lock().await;
        self.core.pull_and_apply().await
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("site_id", &self.core.config.site_id)
            .field("status", &self.status())
            .field("running", &self.running.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl Core {
    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<HealthEvent>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "health events lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let _cycle = self.cycle.lock().await;
                    // Failures are recorded in the sync state.
                    let _ = self.run_tick().await;
                }
            }
        }
        debug!("sync loop stopped");
    }

    async fn handle_event(&self, event: HealthEvent) {
        match event {
            HealthEvent::ModeChanged { to, .. } if to == OperatingMode::Standalone => {
                self.set_status(SyncStatus::Standalone);
            }
            HealthEvent::ModeChanged { from, to } if from == OperatingMode::Standalone => {
                info!(mode = %to, "cloud link recovered, draining offline queue");
                let _cycle = self.cycle.lock().await;
                let _ = self.run_drain().await;
            }
            HealthEvent::ModeChanged { .. } | HealthEvent::LocalRecovered => {}
            HealthEvent::LocalFault { failed } => {
                self.record_failure(&SyncError::LocalUnhealthy(failed.join(", ")));
            }
        }
    }

    async fn run_tick(&self) -> SyncResult<()> {
        self.stats.lock().ticks += 1;

        if self.config.role == OperatingMode::Cloud {
            return Ok(());
        }

        if self.monitor.current_mode() == OperatingMode::Standalone {
            match self.spill_buffer() {
                Ok(0) => {}
                Ok(moved) => info!(count = moved, "offline, buffered changes moved to queue"),
                Err(e) => {
                    self.record_failure(&e);
                    return Err(e);
                }
            }
            self.set_status(SyncStatus::Standalone);
            return Ok(());
        }

        if let Some(failed) = self.monitor.local_fault() {
            let err = SyncError::LocalUnhealthy(failed.join(", "));
            self.record_failure(&err);
            return Err(err);
        }

        let started = Utc::now();
        self.set_status(SyncStatus::Syncing);
        match self.cycle_once().await {
            Ok(()) => {
                self.record_success(started);
                Ok(())
            }
            Err(e) => {
                if let Err(spill) = self.spill_buffer() {
                    error!(error = %spill, "could not persist buffered changes");
                }
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn cycle_once(&self) -> SyncResult<()> {
        // Older queued rows go first so a newer change never overtakes them.
        if self.queue.stats().outstanding() > 0 {
            self.spill_buffer()?;
            self.drain().await?;
        } else {
            self.push_buffer().await?;
        }
        self.pull_and_apply().await?;
        self.send_heartbeat().await;
        Ok(())
    }

    async fn run_drain(&self) -> SyncResult<usize> {
        if self.config.role == OperatingMode::Cloud {
            return Ok(0);
        }
        if self.monitor.current_mode() == OperatingMode::Standalone {
            return Err(SyncError::transport_retryable("cloud link is down"));
        }

        let started = Utc::now();
        self.set_status(SyncStatus::Syncing);
        let drained = match self.spill_buffer() {
            Ok(_) => self.drain().await,
            Err(e) => Err(e),
        };
        // The pull runs even when draining halted.
        let pulled = self.pull_and_apply().await;

        match (drained, pulled) {
            (Ok(count), Ok(_)) => {
                self.send_heartbeat().await;
                self.record_success(started);
                Ok(count)
            }
            (Err(e), _) | (Ok(_), Err(e)) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn push_buffer(&self) -> SyncResult<usize> {
        let mut pending = std::mem::take(&mut *self.buffer.lock());
        let mut pushed = 0;
        let mut offset = 0;

        while offset < pending.len() {
            let end = (offset + self.config.push_batch_size).min(pending.len());
            let batch = pending[offset..end].to_vec();
            match self.push_batch(batch).await {
                Ok(count) => {
                    pushed += count;
                    offset = end;
                }
                Err(e) => {
                    let unsent = pending.split_off(offset);
                    let count = unsent.len();
                    self.spill(unsent)?;
                    info!(count, error = %e, "push failed, buffered changes moved to queue");
                    return Err(e);
                }
            }
        }

        if pushed > 0 {
            debug!(pushed, "buffer pushed");
        }
        Ok(pushed)
    }

    async fn push_batch(&self, entities: Vec<SyncEntity>) -> SyncResult<usize> {
        let count = entities.len();
        let request = PushRequest::new(self.config.site_id.clone(), entities);
        let response = self.transport.push(&request).await?;
        if !response.is_complete() {
            return Err(SyncError::PartialPush {
                synced: response.synced,
                errors: response.errors,
            });
        }
        self.stats.lock().pushed += count as u64;
        Ok(count)
    }

    /// Pushes queue rows oldest first, stopping at the first failed batch.
    async fn drain(&self) -> SyncResult<usize> {
        let mut drained = 0;
        loop {
            let rows = self.queue.dequeue(self.config.drain_batch_size())?;
            if rows.is_empty() {
                break;
            }

            let mut ids = Vec::with_capacity(rows.len());
            let mut entities = Vec::with_capacity(rows.len());
            let mut undecodable = Vec::new();
            for row in &rows {
                match row_to_entity(row) {
                    Ok(entity) => {
                        ids.push(row.id);
                        entities.push(entity);
                    }
                    Err(e) => {
                        warn!(id = row.id, error = %e, "skipping undecodable queue row");
                        undecodable.push(row.id);
                    }
                }
            }
            if !undecodable.is_empty() {
                if let Err(e) = self.settle(&undecodable, Err("undecodable row")) {
                    self.queue.release(&ids);
                    return Err(e);
                }
            }
            if entities.is_empty() {
                break;
            }

            let count = entities.len();
            match self.push_batch(entities).await {
                Ok(_) => {
                    self.settle(&ids, Ok(()))?;
                    drained += count;
                    self.stats.lock().drained += count as u64;
                    info!(
                        batch = count,
                        drained,
                        remaining = self.queue.stats().outstanding(),
                        "offline queue batch delivered"
                    );
                }
                Err(e) => {
                    self.settle(&ids, Err(e.to_string().as_str()))?;
                    warn!(error = %e, drained, "queue drain halted");
                    return Err(e);
                }
            }

            if !undecodable.is_empty() {
                break;
            }
        }
        Ok(drained)
    }

    /// Records the outcome of leased rows, releasing them if that fails.
    fn settle(&self, ids: &[u64], outcome: Result<(), &str>) -> SyncResult<()> {
        let result = match outcome {
            Ok(()) => self.queue.mark_complete(ids),
            Err(reason) => self.queue.mark_failed(ids, reason),
        };
        if let Err(e) = result {
            self.queue.release(ids);
            return Err(e.into());
        }
        Ok(())
    }

    async fn pull_and_apply(&self) -> SyncResult<PullSummary> {
        let since = self
            .checkpoint
            .read()
            .last_sync_at
            .unwrap_or(DateTime::UNIX_EPOCH);
        let mut query = PullQuery::new(self.config.site_id.clone(), since);
        if let Some(entities) = &self.config.pull_entities {
            query = query.with_entities(entities.clone());
        }

        let response = self.transport.pull(&query).await?;
        let (records, rejected) = response.into_records();
        for err in &rejected {
            warn!(error = %err, "rejected pulled record");
        }

        let mut summary = PullSummary {
            pulled: records.len(),
            rejected: rejected.len(),
            ..PullSummary::default()
        };
        for PulledRecord { kind, record } in records {
            self.reconcile(&kind, record, &mut summary).await?;
        }

        {
            let mut stats = self.stats.lock();
            stats.pulled += summary.pulled as u64;
            stats.applied += summary.applied as u64;
            stats.conflicts_kept_local += summary.kept_local as u64;
        }
        debug!(
            pulled = summary.pulled,
            applied = summary.applied,
            kept_local = summary.kept_local,
            since = %since,
            "pull applied"
        );
        Ok(summary)
    }

    async fn reconcile(
        &self,
        kind: &EntityKind,
        remote: SyncRecord,
        summary: &mut PullSummary,
    ) -> SyncResult<()> {
        let local = self.store.lookup(kind, remote.id()).await?;
        let resolved = resolve_conflict(kind, local.as_ref(), &remote);

        if local.as_ref() == Some(&resolved) {
            if resolved == remote {
                summary.unchanged += 1;
            } else {
                debug!(kind = %kind, id = remote.id(), "local copy kept");
                summary.kept_local += 1;
            }
            return Ok(());
        }

        self.store.apply(kind, resolved).await?;
        summary.applied += 1;
        Ok(())
    }

    async fn send_heartbeat(&self) {
        let queue = self.queue.stats();
        let mut request = HeartbeatRequest::new(
            self.config.site_id.clone(),
            self.monitor.current_mode(),
            self.buffer.lock().len() + queue.outstanding(),
        );
        request.agent_version = Some(env!("CARGO_PKG_VERSION").to_string());
        request.uptime_secs = Some(self.started.elapsed().as_secs());
        request.failed_changes = Some(queue.failed);

        match self.transport.heartbeat(&request).await {
            Ok(response) => {
                if let Some(upgrade) = &response.upgrade {
                    info!(
                        target_version = %upgrade.target_version,
                        action = %upgrade.action,
                        "cloud sent an upgrade command"
                    );
                }
                if let Some(peers) = &response.peers {
                    debug!(peers = peers.len(), "cloud advertised peer sites");
                }
                self.checkpoint.write().last_heartbeat = Some(response);
            }
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }

    fn enqueue_entity(&self, entity: &SyncEntity) -> SyncResult<u64> {
        let data = serde_json::to_string(entity.data())
            .map_err(|e| SyncError::Protocol(format!("encode record: {e}")))?;
        let id = self.queue.enqueue_at(
            entity.entity_type().name(),
            entity.action(),
            &data,
            entity.timestamp(),
        )?;
        Ok(id)
    }

    /// Moves entities into the queue in order. Whatever cannot be written is
    /// put back at the front of the buffer.
    fn spill(&self, entities: Vec<SyncEntity>) -> SyncResult<usize> {
        let mut moved = 0;
        let mut entities = entities.into_iter();
        while let Some(entity) = entities.next() {
            if let Err(e) = self.enqueue_entity(&entity) {
                let mut buffer = self.buffer.lock();
                let mut restored: Vec<SyncEntity> =
                    std::iter::once(entity).chain(entities).collect();
                restored.append(&mut buffer);
                *buffer = restored;
                return Err(e);
            }
            moved += 1;
        }
        Ok(moved)
    }

    fn spill_buffer(&self) -> SyncResult<usize> {
        let buffered = std::mem::take(&mut *self.buffer.lock());
        if buffered.is_empty() {
            return Ok(0);
        }
        self.spill(buffered)
    }

    fn set_status(&self, status: SyncStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!(status = ?status, "sync status changed");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(status);
        }
    }

    fn record_success(&self, started: DateTime<Utc>) {
        {
            let mut checkpoint = self.checkpoint.write();
            checkpoint.last_sync_at = Some(started);
            checkpoint.last_error = None;
        }
        self.set_status(SyncStatus::Synced);
    }

    fn record_failure(&self, err: &SyncError) {
        if err.is_security_event() {
            error!(error = %err, "sync aborted by security check");
        } else {
            warn!(error = %err, retryable = err.is_retryable(), "sync failed");
        }
        self.checkpoint.write().last_error = Some(err.to_string());
        self.stats.lock().failures += 1;
        self.set_status(SyncStatus::Error);
    }
}

/// Rebuilds the entity a queue row was made from.
fn row_to_entity(row: &QueuedOperation) -> SyncResult<SyncEntity> {
    let value: serde_json::Value = serde_json::from_str(&row.data)
        .map_err(|e| SyncError::Protocol(format!("queue row {}: {e}", row.id)))?;
    let record = SyncRecord::from_value(value)
        .map_err(|e| SyncError::Protocol(format!("queue row {}: {e}", row.id)))?;
    Ok(SyncEntity::at(
        EntityKind::from(row.entity.as_str()),
        row.operation,
        record,
        row.created_at,
    ))
}
