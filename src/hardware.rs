//! Access to the ASUS `dgpu_disable` and `gpu_mux_mode` attributes

use crate::driver::DriverActivityDetector;
use crate::errors::{GpuControlError, Result};
use crate::mode::{HardwareState, MUX_DISCRETE, MUX_HYBRID};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DGPU_DISABLE: &str = "dgpu_disable";
pub const GPU_MUX_MODE: &str = "gpu_mux_mode";

/// Raw reads and writes of the two GPU attributes
pub trait HardwareGateway: Send + Sync {
    fn supports_eco(&self) -> bool;
    fn supports_mux(&self) -> bool;

    /// `true` when the dGPU is powered off
    fn get_eco_flag(&self) -> Result<bool>;
    fn set_eco_flag(&self, enabled: bool) -> Result<()>;

    fn get_mux_mode(&self) -> Result<u8>;
    /// Takes effect on the next boot only
    fn set_mux_mode(&self, mode: u8) -> Result<()>;

    /// Both attributes; unsupported ones read as dGPU on and hybrid wiring
    fn read_state(&self) -> Result<HardwareState> {
        let eco_enabled = if self.supports_eco() {
            self.get_eco_flag()?
        } else {
            false
        };
        let mux_mode = if self.supports_mux() {
            self.get_mux_mode()?
        } else {
            MUX_HYBRID
        };
        Ok(HardwareState::new(eco_enabled, mux_mode))
    }
}

/// Locate an attribute, preferring the firmware-attributes class over the
/// legacy platform driver
fn locate_attribute(sysfs_root: &Path, name: &str) -> Option<PathBuf> {
    [
        sysfs_root
            .join("class/firmware-attributes/asus-armoury/attributes")
            .join(name)
            .join("current_value"),
        sysfs_root.join("devices/platform/asus-nb-wmi").join(name),
    ]
    .into_iter()
    .find(|path| path.exists())
}

/// Gateway over the asus-wmi sysfs files
pub struct AsusSysfsGateway {
    dgpu_disable: Option<PathBuf>,
    gpu_mux_mode: Option<PathBuf>,
    detector: Arc<dyn DriverActivityDetector>,
}

impl AsusSysfsGateway {
    pub fn new(sysfs_root: &Path, detector: Arc<dyn DriverActivityDetector>) -> Self {
        let dgpu_disable = locate_attribute(sysfs_root, DGPU_DISABLE);
        let gpu_mux_mode = locate_attribute(sysfs_root, GPU_MUX_MODE);

        match &dgpu_disable {
            Some(path) => info!("{} found at {}", DGPU_DISABLE, path.display()),
            None => warn!("{} not supported on this machine", DGPU_DISABLE),
        }
        match &gpu_mux_mode {
            Some(path) => info!("{} found at {}", GPU_MUX_MODE, path.display()),
            None => info!("{} not supported on this machine", GPU_MUX_MODE),
        }

        Self {
            dgpu_disable,
            gpu_mux_mode,
            detector,
        }
    }

    fn path(&self, attribute: &'static str) -> Result<&Path> {
        let path = match attribute {
            DGPU_DISABLE => self.dgpu_disable.as_deref(),
            _ => self.gpu_mux_mode.as_deref(),
        };
        path.ok_or(GpuControlError::Unsupported { attribute })
    }

    fn read(&self, attribute: &'static str) -> Result<u8> {
        let content = fs::read_to_string(self.path(attribute)?)?;
        content.trim().parse().map_err(|_| {
            GpuControlError::Config(format!(
                "Unexpected {} value: {:?}",
                attribute,
                content.trim()
            ))
        })
    }

    fn write(&self, attribute: &'static str, value: u8) -> Result<()> {
        let path = self.path(attribute)?;
        debug!("Writing {} to {}", value, path.display());
        fs::write(path, value.to_string()).map_err(|source| GpuControlError::HardwareRejected {
            attribute,
            value: value.to_string(),
            source,
        })
    }
}

impl HardwareGateway for AsusSysfsGateway {
    fn supports_eco(&self) -> bool {
        self.dgpu_disable.is_some()
    }

    fn supports_mux(&self) -> bool {
        self.gpu_mux_mode.is_some()
    }

    fn get_eco_flag(&self) -> Result<bool> {
        Ok(self.read(DGPU_DISABLE)? == 1)
    }

    fn set_eco_flag(&self, enabled: bool) -> Result<()> {
        // ACPI hot-removal under a bound driver can take the kernel down
        if enabled && self.detector.is_driver_active() {
            return Err(GpuControlError::DriverBound);
        }
        info!("Setting {} = {}", DGPU_DISABLE, u8::from(enabled));
        self.write(DGPU_DISABLE, u8::from(enabled))
    }

    fn get_mux_mode(&self) -> Result<u8> {
        self.read(GPU_MUX_MODE)
    }

    fn set_mux_mode(&self, mode: u8) -> Result<()> {
        if mode != MUX_DISCRETE && mode != MUX_HYBRID {
            return Err(GpuControlError::Config(format!("Invalid MUX mode {}", mode)));
        }
        if self.supports_eco() && self.get_eco_flag()? {
            return Err(GpuControlError::MuxWhileDgpuOff);
        }
        info!("Setting {} = {}", GPU_MUX_MODE, mode);
        self.write(GPU_MUX_MODE, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::GpuVendor;
    use crate::test_support::ToggleDetector;
    use tempfile::TempDir;

    fn legacy_tree(root: &Path, eco: &str, mux: &str) {
        let dir = root.join("devices/platform/asus-nb-wmi");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DGPU_DISABLE), eco).unwrap();
        fs::write(dir.join(GPU_MUX_MODE), mux).unwrap();
    }

    #[test]
    fn test_reads_legacy_layout() {
        let temp_dir = TempDir::new().unwrap();
        legacy_tree(temp_dir.path(), "1\n", "1\n");
        let detector = Arc::new(ToggleDetector::new(GpuVendor::Nvidia, false));
        let gateway = AsusSysfsGateway::new(temp_dir.path(), detector);

        assert!(gateway.supports_eco());
        assert!(gateway.supports_mux());
        assert_eq!(gateway.read_state().unwrap(), HardwareState::new(true, MUX_HYBRID));
    }

    #[test]
    fn test_prefers_firmware_attributes() {
        let temp_dir = TempDir::new().unwrap();
        legacy_tree(temp_dir.path(), "1", "1");
        let armoury = temp_dir
            .path()
            .join("class/firmware-attributes/asus-armoury/attributes/dgpu_disable");
        fs::create_dir_all(&armoury).unwrap();
        fs::write(armoury.join("current_value"), "0").unwrap();

        let detector = Arc::new(ToggleDetector::new(GpuVendor::Nvidia, false));
        let gateway = AsusSysfsGateway::new(temp_dir.path(), detector);
        assert!(!gateway.get_eco_flag().unwrap());
    }

    #[test]
    fn test_intrinsic_guards() {
        let temp_dir = TempDir::new().unwrap();
        legacy_tree(temp_dir.path(), "0", "1");
        let detector = Arc::new(ToggleDetector::new(GpuVendor::Nvidia, true));
        let gateway = AsusSysfsGateway::new(temp_dir.path(), detector.clone());

        assert!(matches!(gateway.set_eco_flag(true), Err(GpuControlError::DriverBound)));
        assert!(!gateway.get_eco_flag().unwrap());

        detector.set_active(false);
        gateway.set_eco_flag(true).unwrap();
        assert!(gateway.get_eco_flag().unwrap());

        assert!(matches!(gateway.set_mux_mode(0), Err(GpuControlError::MuxWhileDgpuOff)));
        assert_eq!(gateway.get_mux_mode().unwrap(), MUX_HYBRID);

        gateway.set_eco_flag(false).unwrap();
        gateway.set_mux_mode(MUX_DISCRETE).unwrap();
        assert_eq!(gateway.get_mux_mode().unwrap(), MUX_DISCRETE);
        assert!(gateway.set_mux_mode(7).is_err());
    }

    #[test]
    fn test_unsupported_machine() {
        let temp_dir = TempDir::new().unwrap();
        let detector = Arc::new(ToggleDetector::new(GpuVendor::Nvidia, false));
        let gateway = AsusSysfsGateway::new(temp_dir.path(), detector);

        assert!(!gateway.supports_eco());
        assert!(matches!(
            gateway.set_eco_flag(false),
            Err(GpuControlError::Unsupported { attribute: DGPU_DISABLE })
        ));
        assert_eq!(gateway.read_state().unwrap(), HardwareState::new(false, MUX_HYBRID));
    }
}
