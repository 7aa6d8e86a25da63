//! Bridge configuration.
//!
//! Read from a JSON file; every field has a default so a partial file (or
//! no file at all) is valid.

use anyhow::{Context, Result};
use duplex_serial::SerialSettings;
use duplex_tcp::SocketSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 1338;

/// Which serial device to open and how to frame it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialSection {
    pub path: String,
    #[serde(flatten)]
    pub settings: SerialSettings,
}

impl Default for SerialSection {
    fn default() -> Self {
        let path = if cfg!(windows) { "COM1" } else { "/dev/ttyACM0" };
        Self {
            path: path.to_string(),
            settings: SerialSettings::default(),
        }
    }
}

/// Where to accept TCP clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpSection {
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub settings: SocketSettings,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            settings: SocketSettings::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub serial: SerialSection,
    pub tcp: TcpSection,
    /// Disconnect stale serial connections and close stale servers before
    /// starting the relay.
    pub startup_cleanup: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial: SerialSection::default(),
            tcp: TcpSection::default(),
            startup_cleanup: true,
        }
    }
}

impl BridgeConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::debug!("loaded config {}", path.display());
        Ok(config)
    }
}
