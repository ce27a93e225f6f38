//! Daemon configuration, loadable from a TOML file with env/flag overrides
//! applied by the CLI.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The default name for the saltctl configuration file.
pub const CONFIG_FILENAME: &str = "saltctl.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub hosts: HostsConfig,
}

/// Settings for the HTTP control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address the control surface binds to.
    pub bind: SocketAddr,
    /// Default wall-clock budget for a start/stop job, in seconds.
    pub default_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 3377)),
            default_timeout_secs: 600,
        }
    }
}

impl ControllerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Settings for the hosts synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// The hosts file kept in sync.
    pub hosts_path: PathBuf,
    /// Where backups are written before every rewrite.
    pub backup_path: PathBuf,
    /// The Docker network whose attachments are mirrored.
    pub network: String,
    /// Domain suffix appended to each alias.
    pub suffix: String,
    /// Quiet period after the last engine event before an update runs.
    pub debounce_secs: u64,
    /// Ceiling on how long a sustained event storm can defer an update.
    pub max_debounce_secs: u64,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            hosts_path: PathBuf::from("/etc/hosts"),
            backup_path: PathBuf::from("/etc/hosts.backup"),
            network: "saltbox".to_string(),
            suffix: "saltbox".to_string(),
            debounce_secs: 1,
            max_debounce_secs: 5,
        }
    }
}

impl HostsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn max_debounce(&self) -> Duration {
        Duration::from_secs(self.max_debounce_secs)
    }
}

impl Config {
    /// Load the configuration from a TOML file, or from `saltctl.toml`
    /// inside the given directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file or directory not found: {}",
                path.display()
            ));
        }

        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&config_path)
            .context(format!("Failed to read config from {}", config_path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        tracing::info!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }
}
