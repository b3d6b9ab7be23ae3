//! Daemon configuration file (cdcsync.toml)

use std::path::{Path, PathBuf};
use std::time::Duration;

use cdcsync_core::Result;

/// Config file name searched next to the daemon's working directory
pub const CONFIG_FILE: &str = "cdcsync.toml";

/// Streaming-daemon configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Content-addressed store location; defaults to the platform cache dir
    pub cas_dir: Option<PathBuf>,
    /// Loopback port of the management endpoint
    pub mgmt_port: u16,
    /// Port range reserved for asset stream forwarding
    pub ports: PortRangeConfig,
    /// Local path of the FUSE binary deployed to instances
    pub fuse_binary: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct PortRangeConfig {
    pub first: u16,
    pub last: u16,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub restart_cooldown_secs: u64,
    pub remote_probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Free-space low-water mark that triggers eviction
    pub low_water_bytes: u64,
    /// How much a triggered sweep tries to free
    pub target_bytes: u64,
    pub interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cas_dir: None,
            mgmt_port: 45800,
            ports: PortRangeConfig::default(),
            fuse_binary: None,
            timeouts: TimeoutConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            first: 45810,
            last: 45909,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 30,
            stop_timeout_secs: 10,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 30,
            restart_cooldown_secs: 60,
            remote_probe_timeout_secs: 10,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            low_water_bytes: 2 * 1024 * 1024 * 1024,
            target_bytes: 512 * 1024 * 1024,
            interval_secs: 60,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    #[must_use]
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }
}

impl DaemonConfig {
    /// Load config from a directory, falling back to defaults when the file
    /// is absent.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                cdcsync_core::Error::invalid_argument(format!(
                    "bad config {}",
                    config_path.display()
                ))
                .with_source(e)
            })?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolved CAS directory
    #[must_use]
    pub fn cas_dir_or_default(&self) -> PathBuf {
        self.cas_dir.clone().unwrap_or_else(|| {
            std::env::var_os("XDG_CACHE_HOME")
                .map(PathBuf::from)
                .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
                .unwrap_or_else(std::env::temp_dir)
                .join("cdcsync/cas")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
cas_dir = "/var/cache/cdcsync"
mgmt_port = 46000
fuse_binary = "/opt/cdcsync/fuse"

[ports]
first = 46010
last = 46020

[timeouts]
heartbeat_timeout_secs = 15

[sweep]
low_water_bytes = 1000000
"#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.mgmt_port, 46000);
        assert_eq!(config.ports.first, 46010);
        assert_eq!(config.timeouts.heartbeat_timeout_secs, 15);
        // Unset fields keep their defaults
        assert_eq!(config.timeouts.start_timeout_secs, 30);
        assert_eq!(config.sweep.low_water_bytes, 1_000_000);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.mgmt_port, 45800);
        assert_eq!(config.ports.last - config.ports.first, 99);
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(dir.path()).unwrap();
        assert_eq!(config.mgmt_port, 45800);
    }
}
