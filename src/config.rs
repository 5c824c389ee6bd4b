// src/config.rs
//
// Bridge configuration. Loadable from a TOML file; every field has a
// default so a bare `canserial` run bridges can0 into /tmp.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IoError;

/// Bridge configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// CAN interface to bind (e.g. "can0", "vcan0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Directory the port symlinks are created in
    #[serde(default = "default_link_dir")]
    pub link_dir: PathBuf,
    /// Symlink name prefix; the hardware id is appended in hex
    #[serde(default = "default_link_base")]
    pub link_base: String,
    /// Liveness tick period in milliseconds
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_link_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_link_base() -> String {
    "ttyCAN0".to_string()
}

fn default_ping_interval_ms() -> u64 {
    250
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            link_dir: default_link_dir(),
            link_base: default_link_base(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self, IoError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IoError::config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| IoError::config(format!("{}: {}", path.display(), e)))
    }
}
