//! Configuration file loading and command-line overrides.

use edgesync_engine::SyncConfig;
use edgesync_protocol::{EntityKind, OperatingMode};
use serde::Deserialize;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Contents of the TOML configuration file.
///
/// Every field is optional so a file can hold a partial configuration that
/// command-line flags or environment variables complete.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Site identifier.
    pub site_id: Option<String>,
    /// Cloud base URL.
    pub cloud_url: Option<String>,
    /// Signing key id, defaults to the site id.
    pub key_id: Option<String>,
    /// Shared signing secret.
    pub signing_key: Option<String>,
    /// `cloud` or `edge`.
    pub role: Option<String>,
    /// Seconds between ticks.
    pub sync_interval_secs: Option<u64>,
    /// Seconds between health probes.
    pub health_check_interval_secs: Option<u64>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: Option<u64>,
    /// Entities per push.
    pub push_batch_size: Option<usize>,
    /// Queue rows per drain batch.
    pub drain_batch_size: Option<usize>,
    /// Offline queue file.
    pub queue_path: Option<PathBuf>,
    /// SHA-256 certificate fingerprint.
    pub tls_pin: Option<String>,
    /// Agreeing probes needed to change mode.
    pub mode_flip_threshold: Option<u32>,
    /// Entity types to pull.
    pub pull_entities: Option<Vec<String>>,
}

/// Values given on the command line or in the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub site_id: Option<String>,
    pub cloud_url: Option<String>,
    pub signing_key: Option<String>,
    pub queue_path: Option<PathBuf>,
}

impl FileConfig {
    /// Reads a configuration file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::parse(&text).map_err(|e| format!("{}: {e}", path.display()).into())
    }

    /// Parses TOML text.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Applies overrides; set values replace file values.
    pub fn merge(mut self, overrides: Overrides) -> Self {
        if overrides.site_id.is_some() {
            self.site_id = overrides.site_id;
        }
        if overrides.cloud_url.is_some() {
            self.cloud_url = overrides.cloud_url;
        }
        if overrides.signing_key.is_some() {
            self.signing_key = overrides.signing_key;
        }
        if overrides.queue_path.is_some() {
            self.queue_path = overrides.queue_path;
        }
        self
    }

    /// Builds and validates the engine configuration.
    pub fn into_sync_config(self) -> Result<SyncConfig, Box<dyn Error>> {
        let site_id = self.site_id.ok_or("site_id is not set")?;
        let cloud_url = self.cloud_url.ok_or("cloud_url is not set")?;
        let signing_key = self.signing_key.ok_or("signing_key is not set")?;

        let mut config = SyncConfig::new(site_id, cloud_url, signing_key);
        if let Some(key_id) = self.key_id {
            config = config.with_key_id(key_id);
        }
        if let Some(role) = self.role {
            config = config.with_role(role.parse::<OperatingMode>()?);
        }
        if let Some(secs) = self.sync_interval_secs {
            config = config.with_sync_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.health_check_interval_secs {
            config = config.with_health_check_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.request_timeout_secs {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(size) = self.push_batch_size {
            config = config.with_push_batch_size(size);
        }
        if let Some(size) = self.drain_batch_size {
            config = config.with_drain_batch_size(size);
        }
        if let Some(path) = self.queue_path {
            config = config.with_queue_path(path);
        }
        if let Some(pin) = self.tls_pin {
            config = config.with_tls_pin(pin);
        }
        if let Some(probes) = self.mode_flip_threshold {
            config = config.with_mode_flip_threshold(probes);
        }
        if let Some(names) = self.pull_entities {
            config = config.with_pull_entities(names.into_iter().map(EntityKind::from).collect());
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        site_id = "site-7"
        cloud_url = "https://cloud.example/api"
        signing_key = "from-file"
        role = "edge"
        sync_interval_secs = 60
        queue_path = "/var/lib/edgesync/queue.journal"
        pull_entities = ["door", "config"]
    "#;

    #[test]
    fn file_values_reach_sync_config() {
        let config = FileConfig::parse(SAMPLE).unwrap().into_sync_config().unwrap();
        assert_eq!(config.site_id, "site-7");
        assert_eq!(config.role, OperatingMode::Edge);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(
            config.pull_entities,
            Some(vec![EntityKind::Door, EntityKind::Config])
        );
        assert_eq!(config.key_id(), "site-7");
    }

    #[test]
    fn overrides_win() {
        let merged = FileConfig::parse(SAMPLE).unwrap().merge(Overrides {
            signing_key: Some("from-env".into()),
            queue_path: Some(PathBuf::from("/tmp/q")),
            ..Overrides::default()
        });
        assert_eq!(merged.signing_key.as_deref(), Some("from-env"));
        assert_eq!(merged.queue_path, Some(PathBuf::from("/tmp/q")));
        assert_eq!(merged.site_id.as_deref(), Some("site-7"));
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = FileConfig::default().into_sync_config().unwrap_err();
        assert!(err.to_string().contains("site_id"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::parse("site = \"typo\"").is_err());
    }

    #[test]
    fn invalid_role_is_rejected() {
        let file = FileConfig::parse(&format!("{SAMPLE}\nmode_flip_threshold = 0")).unwrap();
        assert!(file.into_sync_config().is_err());

        let standalone = FileConfig {
            role: Some("standalone".into()),
            ..FileConfig::parse(SAMPLE).unwrap()
        };
        assert!(standalone.into_sync_config().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgesync.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(FileConfig::load(&path).unwrap().site_id.as_deref(), Some("site-7"));
        assert!(FileConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
