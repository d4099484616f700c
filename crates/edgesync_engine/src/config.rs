//! Configuration for the sync engine.

use crate::client::parse_endpoint;
use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{EntityKind, OperatingMode};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one site's sync engine.
///
/// Built by the process entry point and handed to the engine; nothing here is
/// read from the environment.
#[derive(Clone)]
pub struct SyncConfig {
    /// Site identifier.
    pub site_id: String,
    /// Cloud base URL.
    pub cloud_url: String,
    /// Key identifier sent with every request. Defaults to the site id.
    pub key_id: Option<String>,
    /// Shared signing secret.
    pub signing_key: String,
    /// Static role of this instance.
    pub role: OperatingMode,
    /// Interval between sync ticks.
    pub sync_interval: Duration,
    /// Interval between health probes.
    pub health_check_interval: Duration,
    /// Deadline for each network call.
    pub request_timeout: Duration,
    /// Maximum entities per push.
    pub push_batch_size: usize,
    /// Maximum queue rows per drain batch. Defaults to the push batch size.
    pub drain_batch_size: Option<usize>,
    /// Queue file. `None` keeps the queue in memory.
    pub queue_path: Option<PathBuf>,
    /// SHA-256 fingerprint of the cloud certificate.
    pub tls_pin: Option<String>,
    /// Consecutive agreeing probes required before the mode flips.
    pub mode_flip_threshold: u32,
    /// Entity types to pull. `None` pulls everything.
    pub pull_entities: Option<Vec<EntityKind>>,
}

impl SyncConfig {
    /// Creates a configuration for an edge site with default timings.
    pub fn new(
        site_id: impl Into<String>,
        cloud_url: impl Into<String>,
        signing_key: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            cloud_url: cloud_url.into(),
            key_id: None,
            signing_key: signing_key.into(),
            role: OperatingMode::Edge,
            sync_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            push_batch_size: 50,
            drain_batch_size: None,
            queue_path: None,
            tls_pin: None,
            mode_flip_threshold: 3,
            pull_entities: None,
        }
    }

    /// Sets the key identifier.
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Sets the static role.
    pub fn with_role(mut self, role: OperatingMode) -> Self {
        self.role = role;
        self
    }

    /// Sets the sync tick interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the health probe interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the drain batch size.
    pub fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = Some(size);
        self
    }

    /// Stores the queue in a file.
    pub fn with_queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_path = Some(path.into());
        self
    }

    /// Pins the cloud certificate.
    pub fn with_tls_pin(mut self, fingerprint: impl Into<String>) -> Self {
        self.tls_pin = Some(fingerprint.into());
        self
    }

    /// Sets the mode debounce threshold.
    pub fn with_mode_flip_threshold(mut self, probes: u32) -> Self {
        self.mode_flip_threshold = probes;
        self
    }

    /// Restricts pulls to the given entity types.
    pub fn with_pull_entities(mut self, entities: Vec<EntityKind>) -> Self {
        self.pull_entities = Some(entities);
        self
    }

    /// Returns the key identifier actually sent.
    pub fn key_id(&self) -> &str {
        self.key_id.as_deref().unwrap_or(&self.site_id)
    }

    /// Returns the effective drain batch size.
    pub fn drain_batch_size(&self) -> usize {
        self.drain_batch_size.unwrap_or(self.push_batch_size)
    }

    /// Returns the pinned fingerprint as 64 lowercase hex digits.
    pub fn pinned_fingerprint(&self) -> SyncResult<Option<String>> {
        self.tls_pin.as_deref().map(normalize_fingerprint).transpose()
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.site_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("site_id is empty".into()));
        }
        if self.signing_key.is_empty() {
            return Err(SyncError::InvalidConfig("signing_key is empty".into()));
        }
        if self.role == OperatingMode::Standalone {
            return Err(SyncError::InvalidConfig(
                "STANDALONE is a runtime mode, not a role".into(),
            ));
        }
        if self.push_batch_size == 0 || self.drain_batch_size() == 0 {
            return Err(SyncError::InvalidConfig("batch sizes must be positive".into()));
        }
        if self.mode_flip_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "mode_flip_threshold must be at least 1".into(),
            ));
        }
        for (name, interval) in [
            ("sync_interval", self.sync_interval),
            ("health_check_interval", self.health_check_interval),
            ("request_timeout", self.request_timeout),
        ] {
            if interval.is_zero() {
                return Err(SyncError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.pinned_fingerprint()?.is_some() && parse_endpoint(&self.cloud_url)?.scheme() != "https" {
            return Err(SyncError::InvalidConfig(
                "tls_pin requires an https cloud_url".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("site_id", &self.site_id)
            .field("cloud_url", &self.cloud_url)
            .field("key_id", &self.key_id())
            .field("role", &self.role)
            .field("sync_interval", &self.sync_interval)
            .field("health_check_interval", &self.health_check_interval)
            .field("request_timeout", &self.request_timeout)
            .field("push_batch_size", &self.push_batch_size)
            .field("drain_batch_size", &self.drain_batch_size())
            .field("queue_path", &self.queue_path)
            .field("tls_pin", &self.tls_pin)
            .field("mode_flip_threshold", &self.mode_flip_threshold)
            .finish_non_exhaustive()
    }
}

/// Accepts `AB:CD:...` or plain hex, returns plain lowercase hex.
fn normalize_fingerprint(raw: &str) -> SyncResult<String> {
    let hex: String = raw
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SyncError::InvalidConfig(format!(
            "tls_pin must be a SHA-256 fingerprint, got {raw:?}"
        )));
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig::new("site-1", "https://cloud.example", "secret")
    }

    #[test]
    fn defaults() {
        let config = config();
        assert_eq!(config.key_id(), "site-1");
        assert_eq!(config.drain_batch_size(), 50);
        assert_eq!(config.role, OperatingMode::Edge);
        config.validate().unwrap();

        let config = config.with_key_id("k-9").with_drain_batch_size(5);
        assert_eq!(config.key_id(), "k-9");
        assert_eq!(config.drain_batch_size(), 5);
    }

    #[test]
    fn rejects_standalone_role_and_zero_sizes() {
        assert!(config().with_role(OperatingMode::Standalone).validate().is_err());
        assert!(config().with_push_batch_size(0).validate().is_err());
        assert!(config().with_mode_flip_threshold(0).validate().is_err());
        assert!(config()
            .with_sync_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn pin_normalization() {
        let colon = ["AB"; 32].join(":");
        let config = config().with_tls_pin(colon);
        assert_eq!(config.pinned_fingerprint().unwrap().unwrap(), "ab".repeat(32));
        config.validate().unwrap();

        assert!(SyncConfig::new("s", "https://c", "k")
            .with_tls_pin("abcd")
            .validate()
            .is_err());
        assert!(SyncConfig::new("s", "http://127.0.0.1:8080", "k")
            .with_tls_pin("ab".repeat(32))
            .validate()
            .is_err());
    }

    #[test]
    fn pin_accepts_any_scheme_case() {
        SyncConfig::new("s", "HTTPS://cloud.example", "k")
            .with_tls_pin("ab".repeat(32))
            .validate()
            .unwrap();
    }

    #[test]
    fn debug_hides_secret() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("site-1"));
        assert!(!rendered.contains("secret"));
    }
}
