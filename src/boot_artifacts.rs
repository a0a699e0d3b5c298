//! Files that keep the dGPU driver away on the next boot
//!
//! Three files form one set: a modprobe block, a udev rule removing the dGPU
//! from the bus, and a trigger file naming the mode to apply at startup. They
//! are written and removed together.

use crate::driver::{GpuVendor, NVIDIA_VENDOR_ID};
use crate::errors::{GpuControlError, Result};
use crate::mode::GpuMode;
use crate::privileged::{shell_quote, PrivilegedExecutor};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const NVIDIA_MODULES: [&str; 5] = ["nvidia", "nvidia_drm", "nvidia_modeset", "nvidia_uvm", "nouveau"];
const HEREDOC_MARK: &str = "ASUS_GPU_SWITCH_EOF";

/// Locations of the three boot artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPaths {
    pub modprobe_block: PathBuf,
    pub udev_rule: PathBuf,
    pub trigger: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            modprobe_block: PathBuf::from("/etc/modprobe.d/asus-gpu-switch-block-dgpu.conf"),
            udev_rule: PathBuf::from("/etc/udev/rules.d/50-asus-gpu-switch-remove-dgpu.rules"),
            trigger: PathBuf::from("/etc/asus-gpu-switch/pending-mode"),
        }
    }
}

impl ArtifactPaths {
    /// Same file names under another directory
    pub fn under(dir: &Path) -> Self {
        Self {
            modprobe_block: dir.join("modprobe.d/asus-gpu-switch-block-dgpu.conf"),
            udev_rule: dir.join("udev/rules.d/50-asus-gpu-switch-remove-dgpu.rules"),
            trigger: dir.join("asus-gpu-switch/pending-mode"),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [
            self.modprobe_block.as_path(),
            self.udev_rule.as_path(),
            self.trigger.as_path(),
        ]
    }
}

/// Writes and removes the boot artifact set through a privileged executor
pub struct BootArtifactManager {
    paths: ArtifactPaths,
    vendor: GpuVendor,
    executor: Arc<dyn PrivilegedExecutor>,
    timeout: Duration,
}

impl BootArtifactManager {
    pub fn new(
        paths: ArtifactPaths,
        vendor: GpuVendor,
        executor: Arc<dyn PrivilegedExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            paths,
            vendor,
            executor,
            timeout,
        }
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub fn any_present(&self) -> bool {
        self.paths.all().iter().any(|p| p.exists())
    }

    fn all_present(&self) -> bool {
        self.paths.all().iter().all(|p| p.exists())
    }

    /// Mode recorded in the trigger file, if any
    pub fn pending_trigger(&self) -> Option<GpuMode> {
        let content = fs::read_to_string(&self.paths.trigger).ok()?;
        match content.parse() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!("Ignoring trigger file {}: {}", self.paths.trigger.display(), e);
                None
            }
        }
    }

    fn modprobe_contents(&self) -> String {
        let mut out = String::from("# Written by asus-gpu-switch: keeps the dGPU driver unloaded\n");
        match self.vendor {
            GpuVendor::Nvidia => {
                for module in NVIDIA_MODULES {
                    let _ = writeln!(out, "blacklist {}", module);
                }
                for module in NVIDIA_MODULES {
                    let _ = writeln!(out, "install {} /bin/false", module);
                }
            }
            GpuVendor::Amd => {
                out.push_str("# amdgpu also drives the iGPU; the udev rule removes the dGPU instead\n");
            }
        }
        out
    }

    fn udev_contents(&self, pci_address: Option<&str>) -> String {
        let mut out = String::from("# Written by asus-gpu-switch: removes the dGPU from the bus\n");
        match (self.vendor, pci_address) {
            (GpuVendor::Nvidia, _) => {
                // display function and its HDMI audio sibling
                for class in ["0x030000", "0x030200", "0x040300"] {
                    let _ = writeln!(
                        out,
                        "ACTION==\"add\", SUBSYSTEM==\"pci\", ATTR{{vendor}}==\"{}\", ATTR{{class}}==\"{}\", ATTR{{remove}}=\"1\"",
                        NVIDIA_VENDOR_ID, class
                    );
                }
            }
            (GpuVendor::Amd, Some(address)) => {
                let _ = writeln!(
                    out,
                    "ACTION==\"add\", SUBSYSTEM==\"pci\", KERNEL==\"{}\", ATTR{{remove}}=\"1\"",
                    address
                );
            }
            (GpuVendor::Amd, None) => {
                out.push_str("# dGPU address unknown, nothing to match\n");
            }
        }
        out
    }

    fn quoted_paths(&self) -> String {
        self.paths
            .all()
            .iter()
            .map(|p| shell_quote(&p.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Shell script writing all three files for `mode`. Any failing step
    /// removes the whole set before exiting non-zero.
    pub fn write_script(&self, mode: GpuMode, pci_address: Option<&str>) -> String {
        let mut script = String::new();
        let _ = writeln!(script, "undo() {{ rm -f {}; exit 1; }}", self.quoted_paths());

        let mut dirs: Vec<String> = self
            .paths
            .all()
            .iter()
            .filter_map(|p| p.parent())
            .map(|d| shell_quote(&d.to_string_lossy()))
            .collect();
        dirs.dedup();
        let _ = writeln!(script, "mkdir -p {} || undo", dirs.join(" "));

        let files = [
            (&self.paths.modprobe_block, self.modprobe_contents()),
            (&self.paths.udev_rule, self.udev_contents(pci_address)),
            (&self.paths.trigger, format!("{}\n", mode.as_str())),
        ];
        for (path, contents) in files {
            let _ = write!(
                script,
                "cat > {} <<'{mark}' || undo\n{}{mark}\n",
                shell_quote(&path.to_string_lossy()),
                contents,
                mark = HEREDOC_MARK
            );
        }
        script
    }

    /// Write the artifact set. Verified by exit status and by looking for
    /// the files afterwards; a failed write leaves none of them behind.
    pub fn write_driver_block(&self, mode: GpuMode, pci_address: Option<&str>) -> Result<()> {
        info!("Writing boot artifacts for {} mode", mode);
        let output = match self
            .executor
            .run(&self.write_script(mode, pci_address), self.timeout)
        {
            Ok(output) => output,
            Err(e) => {
                self.discard_partial_set();
                return Err(e);
            }
        };

        if output.success() && self.all_present() {
            info!("Boot artifacts in place");
            return Ok(());
        }

        warn!("Boot artifacts not written (exit {:?})", output.code);
        if self.any_present() {
            self.discard_partial_set();
        }
        Err(GpuControlError::PrivilegedFailed {
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }

    fn discard_partial_set(&self) {
        if let Err(e) = self.remove_driver_block() {
            warn!("Partial boot artifact set left behind: {}", e);
        }
    }

    /// Remove the artifact set. No privileged call when nothing exists.
    pub fn remove_driver_block(&self) -> Result<()> {
        if !self.any_present() {
            debug!("No boot artifacts to remove");
            return Ok(());
        }

        info!("Removing boot artifacts");
        let output = self
            .executor
            .run(&format!("rm -f {}", self.quoted_paths()), self.timeout)?;

        if self.any_present() {
            warn!("Boot artifacts still present after removal (exit {:?})", output.code);
            Err(GpuControlError::PrivilegedFailed {
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privileged::{Elevation, SystemExecutor};
    use crate::test_support::CountingExecutor;
    use tempfile::TempDir;

    fn manager(dir: &Path, vendor: GpuVendor, executor: Arc<dyn PrivilegedExecutor>) -> BootArtifactManager {
        BootArtifactManager::new(ArtifactPaths::under(dir), vendor, executor, Duration::from_secs(10))
    }

    #[test]
    fn test_write_and_remove_set() {
        let temp_dir = TempDir::new().unwrap();
        let executor = Arc::new(SystemExecutor::new(Elevation::Direct));
        let artifacts = manager(temp_dir.path(), GpuVendor::Nvidia, executor);

        artifacts.write_driver_block(GpuMode::Eco, None).unwrap();
        let paths = artifacts.paths().clone();
        assert!(paths.modprobe_block.exists());
        assert!(paths.udev_rule.exists());
        assert_eq!(artifacts.pending_trigger(), Some(GpuMode::Eco));

        let block = fs::read_to_string(&paths.modprobe_block).unwrap();
        assert!(block.contains("blacklist nvidia_drm"));
        assert!(block.contains("install nvidia /bin/false"));
        let rule = fs::read_to_string(&paths.udev_rule).unwrap();
        assert!(rule.contains("ATTR{vendor}==\"0x10de\""));

        artifacts.remove_driver_block().unwrap();
        assert!(!artifacts.any_present());
        assert_eq!(artifacts.pending_trigger(), None);
    }

    #[test]
    fn test_amd_rule_targets_address() {
        let temp_dir = TempDir::new().unwrap();
        let executor = Arc::new(SystemExecutor::new(Elevation::Direct));
        let artifacts = manager(temp_dir.path(), GpuVendor::Amd, executor);

        artifacts.write_driver_block(GpuMode::Eco, Some("0000:03:00.0")).unwrap();
        let block = fs::read_to_string(&artifacts.paths().modprobe_block).unwrap();
        assert!(!block.contains("blacklist amdgpu"));
        let rule = fs::read_to_string(&artifacts.paths().udev_rule).unwrap();
        assert!(rule.contains("KERNEL==\"0000:03:00.0\""));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let executor = Arc::new(CountingExecutor::succeeding());
        let artifacts = manager(temp_dir.path(), GpuVendor::Nvidia, executor.clone());

        artifacts.remove_driver_block().unwrap();
        artifacts.remove_driver_block().unwrap();
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn test_unverified_write_fails() {
        let temp_dir = TempDir::new().unwrap();
        // exit code 0 but nothing written
        let executor = Arc::new(CountingExecutor::succeeding());
        let artifacts = manager(temp_dir.path(), GpuVendor::Nvidia, executor.clone());

        assert!(matches!(
            artifacts.write_driver_block(GpuMode::Eco, None),
            Err(GpuControlError::PrivilegedFailed { .. })
        ));
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn test_failed_write_leaves_no_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let executor = Arc::new(SystemExecutor::new(Elevation::Direct));
        let artifacts = manager(temp_dir.path(), GpuVendor::Nvidia, executor);

        // the udev rule cannot be written over a directory
        let paths = artifacts.paths().clone();
        fs::create_dir_all(&paths.udev_rule).unwrap();

        assert!(matches!(
            artifacts.write_driver_block(GpuMode::Eco, None),
            Err(GpuControlError::PrivilegedFailed { .. })
        ));
        assert!(!paths.modprobe_block.exists());
        assert!(!paths.trigger.exists());
        assert_eq!(artifacts.pending_trigger(), None);
    }

    #[test]
    fn test_partial_set_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let executor = Arc::new(SystemExecutor::new(Elevation::Direct));
        let artifacts = manager(temp_dir.path(), GpuVendor::Nvidia, executor);

        let trigger = &artifacts.paths().trigger;
        fs::create_dir_all(trigger.parent().unwrap()).unwrap();
        fs::write(trigger, "eco\n").unwrap();
        assert!(artifacts.any_present());

        artifacts.remove_driver_block().unwrap();
        assert!(!artifacts.any_present());
    }
}
