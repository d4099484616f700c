//! Hub configuration.

use edgesync_protocol::{UpgradeCommand, MAX_CLOCK_SKEW};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Configuration for the reference hub.
#[derive(Clone)]
pub struct ServerConfig {
    /// Shared secrets by key id.
    pub keys: HashMap<String, Vec<u8>>,
    /// Site each key may write as, when it differs from the key id.
    pub key_sites: HashMap<String, String>,
    /// Maximum entities accepted in one push.
    pub max_push_batch: usize,
    /// Accepted clock skew for signed requests.
    pub max_skew: Duration,
    /// Upgrade advertised to sites running another version.
    pub upgrade: Option<UpgradeCommand>,
    /// Whether heartbeat responses list the other known sites.
    pub advertise_peers: bool,
}

impl ServerConfig {
    /// Creates a configuration with no keys.
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            key_sites: HashMap::new(),
            max_push_batch: 500,
            max_skew: MAX_CLOCK_SKEW,
            upgrade: None,
            advertise_peers: false,
        }
    }

    /// Registers a site key.
    pub fn with_key(mut self, key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(key_id.into(), secret.into());
        self
    }

    /// Registers a key whose id differs from the site it belongs to.
    pub fn with_site_key(
        mut self,
        key_id: impl Into<String>,
        site_id: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        let key_id = key_id.into();
        self.key_sites.insert(key_id.clone(), site_id.into());
        self.keys.insert(key_id, secret.into());
        self
    }

    /// Returns the site a key authenticates. Defaults to the key id itself.
    pub fn site_for_key<'a>(&'a self, key_id: &'a str) -> &'a str {
        self.key_sites.get(key_id).map_or(key_id, String::as_str)
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the accepted clock skew.
    pub fn with_max_skew(mut self, skew: Duration) -> Self {
        self.max_skew = skew;
        self
    }

    /// Advertises an upgrade in heartbeat responses.
    pub fn with_upgrade(mut self, upgrade: UpgradeCommand) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Enables the peer list in heartbeat responses.
    pub fn with_peers(mut self, advertise: bool) -> Self {
        self.advertise_peers = advertise;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut key_ids: Vec<&String> = self.keys.keys().collect();
        key_ids.sort();
        f.debug_struct("ServerConfig")
            .field("key_ids", &key_ids)
            .field("max_push_batch", &self.max_push_batch)
            .field("max_skew", &self.max_skew)
            .field("upgrade", &self.upgrade)
            .field("advertise_peers", &self.advertise_peers)
            .finish()
    }
}
