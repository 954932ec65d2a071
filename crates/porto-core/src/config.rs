//! Daemon configuration.
//!
//! Loaded from layered sources, later layers winning:
//!
//! 1. Built-in defaults
//! 2. `/etc/portod.toml`
//! 3. Environment variables prefixed `PORTOD_`
//!
//! ## Example
//!
//! ```toml
//! socket_path = "/run/portod.socket"
//! data_dir = "/var/lib/porto"
//!
//! [daemon]
//! stop_timeout_ms = 30000
//! reap_interval_ms = 1000
//!
//! [network]
//! enabled = true
//! devices = ["eth0"]
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// System-wide config file location.
const SYSTEM_CONFIG: &str = "/etc/portod.toml";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RPC socket path.
    pub socket_path: PathBuf,
    /// Root of persistent daemon state.
    pub data_dir: PathBuf,
    /// Lifecycle tunables.
    pub daemon: DaemonConfig,
    /// Traffic-control settings.
    pub network: NetworkConfig,
}

/// Lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Grace period before a stop escalates to SIGKILL.
    pub stop_timeout_ms: u64,
    /// How often dead init processes are collected.
    pub reap_interval_ms: u64,
}

/// Traffic-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// When false, every tc operation is a successful no-op.
    pub enabled: bool,
    /// Links to manage; each gets the root qdisc and filter.
    pub devices: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/portod.socket"),
            data_dir: PathBuf::from("/var/lib/porto"),
            daemon: DaemonConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 30_000,
            reap_interval_ms: 1_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from the system file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a layer cannot be parsed.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(SYSTEM_CONFIG))
            .merge(Env::prefixed("PORTOD_").split("_"))
            .extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PORTOD_").split("_"))
            .extract()
    }

    /// Directory of per-container key-value nodes.
    #[must_use]
    pub fn kv_dir(&self) -> PathBuf {
        self.data_dir.join("kv")
    }

    /// Directory of volume backing storage.
    #[must_use]
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Graceful stop timeout as a duration.
    #[must_use]
    pub const fn stop_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.daemon.stop_timeout_ms)
    }

    /// Reaper cadence as a duration.
    #[must_use]
    pub const fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.daemon.reap_interval_ms)
    }
}
