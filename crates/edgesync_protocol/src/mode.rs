//! Operating modes of a site instance.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The operating mode of an instance.
///
/// `Cloud` and `Edge` are static roles chosen at deployment. `Standalone` is
/// only ever entered by an edge instance that lost its cloud link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    /// This instance is the hub.
    Cloud,
    /// Cloud-connected site instance.
    Edge,
    /// Site instance with no cloud connectivity.
    Standalone,
}

impl OperatingMode {
    /// Returns true if a cloud link is assumed in this mode.
    pub fn is_connected(&self) -> bool {
        !matches!(self, OperatingMode::Standalone)
    }

    /// Returns the wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Cloud => "CLOUD",
            OperatingMode::Edge => "EDGE",
            OperatingMode::Standalone => "STANDALONE",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CLOUD" => Ok(OperatingMode::Cloud),
            "EDGE" => Ok(OperatingMode::Edge),
            "STANDALONE" => Ok(OperatingMode::Standalone),
            _ => Err(ProtocolError::UnknownMode(s.to_string())),
        }
    }
}
