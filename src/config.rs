use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Snapshots buffered per websocket before the observer is dropped.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TuningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_zfs_conf_path")]
    pub zfs_conf_path: PathBuf,
    #[serde(default = "default_nvme_conf_path")]
    pub nvme_conf_path: PathBuf,
    #[serde(default = "default_true")]
    pub apply_sysctl: bool,
    #[serde(default)]
    pub skip_existing: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub smart_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default = "default_meminfo_path")]
    pub meminfo_path: PathBuf,
    #[serde(default = "default_thermal_zone_path")]
    pub thermal_zone_path: PathBuf,
    #[serde(default = "default_arcstats_path")]
    pub arcstats_path: PathBuf,
    #[serde(default = "default_diskstats_path")]
    pub diskstats_path: PathBuf,
    #[serde(default = "default_net_class_path")]
    pub net_class_path: PathBuf,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zfs_conf_path: default_zfs_conf_path(),
            nvme_conf_path: default_nvme_conf_path(),
            apply_sysctl: true,
            skip_existing: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smart_enabled: false,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            meminfo_path: default_meminfo_path(),
            thermal_zone_path: default_thermal_zone_path(),
            arcstats_path: default_arcstats_path(),
            diskstats_path: default_diskstats_path(),
            net_class_path: default_net_class_path(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        Self::from_yaml(&text, &path_display)
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.tool_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "tool_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::Validation(
                "subscriber_queue must be >= 1".to_string(),
            ));
        }

        validate_tuning(&self.tuning)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_tuning(cfg: &TuningConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.zfs_conf_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "tuning.zfs_conf_path must not be empty".to_string(),
        ));
    }
    if cfg.nvme_conf_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "tuning.nvme_conf_path must not be empty".to_string(),
        ));
    }
    Ok(())
}

const fn default_true() -> bool {
    true
}

const fn default_interval_secs() -> u64 {
    2
}

const fn default_tool_timeout_ms() -> u64 {
    5000
}

const fn default_subscriber_queue() -> usize {
    16
}

fn default_zfs_conf_path() -> PathBuf {
    PathBuf::from("/etc/modprobe.d/zfs.conf")
}

fn default_nvme_conf_path() -> PathBuf {
    PathBuf::from("/etc/modprobe.d/nvme.conf")
}

fn default_meminfo_path() -> PathBuf {
    PathBuf::from("/proc/meminfo")
}

fn default_thermal_zone_path() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_arcstats_path() -> PathBuf {
    PathBuf::from("/proc/spl/kstat/zfs/arcstats")
}

fn default_diskstats_path() -> PathBuf {
    PathBuf::from("/proc/diskstats")
}

fn default_net_class_path() -> PathBuf {
    PathBuf::from("/sys/class/net")
}
