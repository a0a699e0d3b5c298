use super::{read_trimmed, scan_display_devices, DriverActivityDetector, GpuVendor, NVIDIA_VENDOR_ID};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Module whose reference count reflects display-stack users
const DISPLAY_MODULE: &str = "nvidia_drm";

/// NVIDIA: the display stack holds `nvidia_drm` references while it uses the dGPU
pub struct NvidiaDetector {
    sysfs_root: PathBuf,
}

impl NvidiaDetector {
    pub fn new(sysfs_root: &Path) -> Self {
        Self {
            sysfs_root: sysfs_root.to_path_buf(),
        }
    }
}

impl DriverActivityDetector for NvidiaDetector {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    fn is_driver_active(&self) -> bool {
        let module_dir = self.sysfs_root.join("module").join(DISPLAY_MODULE);
        if !module_dir.exists() {
            debug!("{} not loaded", DISPLAY_MODULE);
            return false;
        }

        match read_trimmed(&module_dir.join("refcnt")).map(|s| s.parse::<u32>()) {
            Some(Ok(count)) => {
                debug!("{} refcnt = {}", DISPLAY_MODULE, count);
                count > 0
            }
            _ => {
                warn!("{} loaded but refcnt unreadable, treating as active", DISPLAY_MODULE);
                true
            }
        }
    }

    fn discrete_pci_address(&self) -> Option<String> {
        scan_display_devices(&self.sysfs_root)
            .into_iter()
            .find(|d| d.vendor == NVIDIA_VENDOR_ID)
            .map(|d| d.address)
    }
}
