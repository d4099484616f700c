//! Operating-mode derivation from periodic health probes.
//!
//! Probes run in a fixed order: every local dependency, then the cloud
//! endpoint. An unhealthy local dependency is a fault, not a mode: it is
//! reported as [`HealthEvent::LocalFault`] and the mode is left alone. With
//! local dependencies healthy, an unreachable cloud means
//! [`OperatingMode::Standalone`] and a reachable one means the configured
//! role.
//!
//! Every probe is bounded by a timeout; a probe that does not answer in
//! time counts as unhealthy.
//!
//! Mode flips are debounced: after the first probe, a new mode must be
//! observed on `threshold` consecutive probes before it is emitted.

use crate::transport::SyncTransport;
use async_trait::async_trait;
use edgesync_protocol::OperatingMode;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default deadline for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A local dependency probe (database, cache, ...).
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name used in logs and fault reports.
    fn name(&self) -> &str;

    /// Returns true if the dependency is usable.
    async fn check(&self) -> bool;
}

/// A probe whose answer is set by hand.
#[derive(Debug)]
pub struct StaticCheck {
    name: String,
    healthy: AtomicBool,
}

impl StaticCheck {
    /// Creates a probe with an initial answer.
    pub fn new(name: impl Into<String>, healthy: bool) -> Self {
        Self {
            name: name.into(),
            healthy: AtomicBool::new(healthy),
        }
    }

    /// Changes the answer.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthCheck for StaticCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// A probe that replays a fixed script, then repeats its last answer.
#[derive(Debug)]
pub struct FlakyCheck {
    name: String,
    script: Mutex<VecDeque<bool>>,
    last: AtomicBool,
}

impl FlakyCheck {
    /// Creates a scripted probe.
    pub fn new(name: impl Into<String>, script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into_iter().collect()),
            last: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl HealthCheck for FlakyCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> bool {
        match self.script.lock().pop_front() {
            Some(answer) => {
                self.last.store(answer, Ordering::SeqCst);
                answer
            }
            None => self.last.load(Ordering::SeqCst),
        }
    }
}

/// A notification from the monitor. Each is sent once per change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The operating mode flipped.
    ModeChanged {
        /// Previous mode.
        from: OperatingMode,
        /// New mode.
        to: OperatingMode,
    },
    /// A local dependency started failing.
    LocalFault {
        /// Names of the failing dependencies.
        failed: Vec<String>,
    },
    /// All local dependencies are healthy again.
    LocalRecovered,
}

/// Outcome of one probe round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Mode in effect after this round.
    pub mode: OperatingMode,
    /// Local dependencies that failed.
    pub failed_dependencies: Vec<String>,
    /// Whether the cloud answered its liveness probe. `None` when not probed.
    pub cloud_reachable: Option<bool>,
    /// Whether this round changed the mode.
    pub mode_changed: bool,
}

#[derive(Debug)]
struct Debounce {
    probed: bool,
    candidate: Option<OperatingMode>,
    streak: u32,
    fault: Option<Vec<String>>,
}

/// Derives the operating mode and notifies subscribers on transitions.
pub struct HealthMonitor {
    role: OperatingMode,
    checks: Vec<Arc<dyn HealthCheck>>,
    transport: Arc<dyn SyncTransport>,
    threshold: u32,
    interval: Duration,
    probe_timeout: Duration,
    mode: watch::Sender<OperatingMode>,
    events: broadcast::Sender<HealthEvent>,
    debounce: Mutex<Debounce>,
}

impl HealthMonitor {
    /// Creates a monitor. The mode starts at `role` until the first probe.
    pub fn new(
        role: OperatingMode,
        checks: Vec<Arc<dyn HealthCheck>>,
        transport: Arc<dyn SyncTransport>,
        threshold: u32,
        interval: Duration,
    ) -> Self {
        let (mode, _) = watch::channel(role);
        let (events, _) = broadcast::channel(32);
        Self {
            role,
            checks,
            transport,
            threshold: threshold.max(1),
            interval,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            mode,
            events,
            debounce: Mutex::new(Debounce {
                probed: false,
                candidate: None,
                streak: 0,
                fault: None,
            }),
        }
    }

    /// Sets the deadline applied to each probe.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Returns the mode currently in effect.
    pub fn current_mode(&self) -> OperatingMode {
        *self.mode.borrow()
    }

    /// Returns the failing local dependencies, if any.
    pub fn local_fault(&self) -> Option<Vec<String>> {
        self.debounce.lock().fault.clone()
    }

    /// Subscribes to mode and fault transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Returns a receiver that always holds the current mode.
    pub fn watch_mode(&self) -> watch::Receiver<OperatingMode> {
        self.mode.subscribe()
    }

    /// Runs one probe round.
    pub async fn check_once(&self) -> HealthReport {
        let mut failed = Vec::new();
        for check in &self.checks {
            let healthy = match tokio::time::timeout(self.probe_timeout, check.check()).await {
                Ok(healthy) => healthy,
                Err(_) => {
                    warn!(
                        check = check.name(),
                        timeout = ?self.probe_timeout,
                        "local health probe timed out"
                    );
                    false
                }
            };
            if !healthy {
                failed.push(check.name().to_string());
            }
        }

        if !failed.is_empty() {
            self.record_fault(failed.clone());
            return HealthReport {
                mode: self.current_mode(),
                failed_dependencies: failed,
                cloud_reachable: None,
                mode_changed: false,
            };
        }
        self.record_recovery();

        let (observed, cloud_reachable) = if self.role == OperatingMode::Cloud {
            (OperatingMode::Cloud, None)
        } else {
            match tokio::time::timeout(self.probe_timeout, self.transport.check_health()).await {
                Ok(Ok(())) => (self.role, Some(true)),
                Ok(Err(e)) => {
                    debug!(error = %e, "cloud health probe failed");
                    (OperatingMode::Standalone, Some(false))
                }
                Err(_) => {
                    debug!(timeout = ?self.probe_timeout, "cloud health probe timed out");
                    (OperatingMode::Standalone, Some(false))
                }
            }
        };

        let mode_changed = self.observe(observed);
        HealthReport {
            mode: self.current_mode(),
            failed_dependencies: Vec::new(),
            cloud_reachable,
            mode_changed,
        }
    }

    /// Probes on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        debug!("health monitor stopped");
    }

    fn record_fault(&self, failed: Vec<String>) {
        let mut state = self.debounce.lock();
        if state.fault.as_ref() == Some(&failed) {
            return;
        }
        warn!(failed = ?failed, "local dependency unhealthy");
        state.fault = Some(failed.clone());
        drop(state);
        let _ = self.events.send(HealthEvent::LocalFault { failed });
    }

    fn record_recovery(&self) {
        let mut state = self.debounce.lock();
        if state.fault.take().is_some() {
            drop(state);
            info!("local dependencies recovered");
            let _ = self.events.send(HealthEvent::LocalRecovered);
        }
    }

    /// Feeds one observation through the debounce. Returns true on a flip.
    fn observe(&self, observed: OperatingMode) -> bool {
        let current = self.current_mode();
        let mut state = self.debounce.lock();
        let first = !state.probed;
        state.probed = true;

        if observed == current {
            state.candidate = None;
            state.streak = 0;
            return false;
        }

        if state.candidate == Some(observed) {
            state.streak += 1;
        } else {
            state.candidate = Some(observed);
            state.streak = 1;
        }

        if !first && state.streak < self.threshold {
            debug!(
                observed = %observed,
                streak = state.streak,
                threshold = self.threshold,
                "mode change pending"
            );
            return false;
        }

        state.candidate = None;
        state.streak = 0;
        drop(state);

        self.mode.send_replace(observed);
        info!(from = %current, to = %observed, "operating mode changed");
        let _ = self.events.send(HealthEvent::ModeChanged {
            from: current,
            to: observed,
        });
        true
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("role", &self.role)
            .field("mode", &self.current_mode())
            .field("threshold", &self.threshold)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn monitor(
        checks: Vec<Arc<dyn HealthCheck>>,
        transport: Arc<MockTransport>,
        threshold: u32,
    ) -> HealthMonitor {
        HealthMonitor::new(
            OperatingMode::Edge,
            checks,
            transport,
            threshold,
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn first_probe_is_authoritative() {
        let transport = Arc::new(MockTransport::new());
        transport.set_reachable(false);
        let monitor = monitor(Vec::new(), transport, 3);
        let mut events = monitor.subscribe();

        let report = monitor.check_once().await;
        assert!(report.mode_changed);
        assert_eq!(monitor.current_mode(), OperatingMode::Standalone);
        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::ModeChanged {
                from: OperatingMode::Edge,
                to: OperatingMode::Standalone
            }
        );
    }

    #[tokio::test]
    async fn single_failed_probe_does_not_flip() {
        let transport = Arc::new(MockTransport::new());
        let monitor = monitor(Vec::new(), transport.clone(), 3);
        let mut events = monitor.subscribe();

        monitor.check_once().await;
        transport.set_reachable(false);
        monitor.check_once().await;
        transport.set_reachable(true);
        monitor.check_once().await;
        monitor.check_once().await;

        assert_eq!(monitor.current_mode(), OperatingMode::Edge);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn sustained_outage_flips_once() {
        let transport = Arc::new(MockTransport::new());
        let monitor = monitor(Vec::new(), transport.clone(), 3);
        let mut events = monitor.subscribe();

        monitor.check_once().await;
        transport.set_reachable(false);
        for _ in 0..6 {
            monitor.check_once().await;
        }

        assert_eq!(monitor.current_mode(), OperatingMode::Standalone);
        assert!(matches!(
            events.try_recv().unwrap(),
            HealthEvent::ModeChanged {
                to: OperatingMode::Standalone,
                ..
            }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_fault_keeps_mode() {
        let transport = Arc::new(MockTransport::new());
        let database = Arc::new(StaticCheck::new("database", true));
        let cache: Arc<dyn HealthCheck> = Arc::new(FlakyCheck::new("cache", [true]));
        let checks: Vec<Arc<dyn HealthCheck>> = vec![database.clone(), cache];
        let monitor = monitor(checks, transport, 1);
        let mut events = monitor.subscribe();

        monitor.check_once().await;
        database.set_healthy(false);
        let report = monitor.check_once().await;
        monitor.check_once().await;

        assert_eq!(report.failed_dependencies, vec!["database".to_string()]);
        assert_eq!(report.cloud_reachable, None);
        assert_eq!(monitor.current_mode(), OperatingMode::Edge);
        assert_eq!(monitor.local_fault(), Some(vec!["database".to_string()]));
        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::LocalFault {
                failed: vec!["database".into()]
            }
        );
        assert!(events.try_recv().is_err());

        database.set_healthy(true);
        monitor.check_once().await;
        assert_eq!(events.try_recv().unwrap(), HealthEvent::LocalRecovered);
        assert!(monitor.local_fault().is_none());
    }

    #[tokio::test]
    async fn cloud_role_never_probes_the_link() {
        let transport = Arc::new(MockTransport::new());
        transport.set_reachable(false);
        let monitor = HealthMonitor::new(
            OperatingMode::Cloud,
            Vec::new(),
            transport,
            1,
            Duration::from_secs(1),
        );
        let report = monitor.check_once().await;
        assert_eq!(report.mode, OperatingMode::Cloud);
        assert!(!report.mode_changed);
    }

    struct HungCheck;

    #[async_trait]
    impl HealthCheck for HungCheck {
        fn name(&self) -> &str {
            "database"
        }

        async fn check(&self) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_times_out_as_unhealthy() {
        let transport = Arc::new(MockTransport::new());
        let checks: Vec<Arc<dyn HealthCheck>> = vec![Arc::new(HungCheck)];
        let monitor = monitor(checks, transport, 1).with_probe_timeout(Duration::from_secs(2));

        let report = tokio::time::timeout(Duration::from_secs(60), monitor.check_once())
            .await
            .unwrap();
        assert_eq!(report.failed_dependencies, vec!["database".to_string()]);
        assert_eq!(monitor.local_fault(), Some(vec!["database".to_string()]));
        assert_eq!(monitor.current_mode(), OperatingMode::Edge);
    }

    #[tokio::test]
    async fn flaky_check_replays_script() {
        let check = FlakyCheck::new("db", [false, true, false]);
        assert!(!check.check().await);
        assert!(check.check().await);
        assert!(!check.check().await);
        assert!(!check.check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_on_cancel() {
        let transport = Arc::new(MockTransport::new());
        transport.set_reachable(false);
        let monitor = Arc::new(monitor(Vec::new(), transport, 1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.current_mode(), OperatingMode::Standalone);

        cancel.cancel();
        handle.await.unwrap();
    }
}
