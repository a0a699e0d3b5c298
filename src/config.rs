//! Daemon configuration file

use crate::boot_artifacts::ArtifactPaths;
use crate::controller::ControllerSettings;
use crate::driver::GpuVendor;
use crate::errors::{GpuControlError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/asus-gpu-switch/config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub sysfs_root: PathBuf,
    pub state_path: PathBuf,
    /// Skip PCI detection and assume this dGPU vendor
    pub vendor: Option<GpuVendor>,
    pub settle_delay_ms: u64,
    pub auto_settle_ms: u64,
    pub release_timeout_secs: u64,
    pub artifact_timeout_secs: u64,
    pub power_poll_interval_ms: u64,
    pub artifacts: ArtifactPaths,
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            state_path: PathBuf::from("/var/lib/asus-gpu-switch/state.json"),
            vendor: None,
            settle_delay_ms: 1500,
            auto_settle_ms: 1000,
            release_timeout_secs: 120,
            artifact_timeout_secs: 30,
            power_poll_interval_ms: 2000,
            artifacts: ArtifactPaths::default(),
            log_file: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: DaemonConfig = serde_json::from_str(&json).map_err(|e| {
            GpuControlError::Config(format!("{}: {}", path.display(), e))
        })?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn get_config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            auto_settle: Duration::from_millis(self.auto_settle_ms),
        }
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn artifact_timeout(&self) -> Duration {
        Duration::from_secs(self.artifact_timeout_secs)
    }

    pub fn power_poll_interval(&self) -> Duration {
        Duration::from_millis(self.power_poll_interval_ms.max(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = DaemonConfig::load(&temp_dir.path().join("config.json")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.release_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"vendor": "amd", "settle_delay_ms": 250, "artifacts": {"trigger": "/run/gpu-mode"}}"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.vendor, Some(GpuVendor::Amd));
        assert_eq!(
            config.controller_settings().settle_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.artifacts.trigger, PathBuf::from("/run/gpu-mode"));
        assert_eq!(config.artifacts.modprobe_block, ArtifactPaths::default().modprobe_block);
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(DaemonConfig::load(&path), Err(GpuControlError::Config(_))));
    }
}
