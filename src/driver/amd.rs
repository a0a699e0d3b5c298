use super::{read_trimmed, scan_display_devices, DriverActivityDetector, GpuVendor, PciDisplayDevice, AMD_VENDOR_ID};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// AMD: amdgpu also drives the iGPU, so module refcounts say nothing.
/// The dGPU counts as idle only when runtime PM has suspended it.
pub struct AmdDetector {
    sysfs_root: PathBuf,
}

impl AmdDetector {
    pub fn new(sysfs_root: &Path) -> Self {
        Self {
            sysfs_root: sysfs_root.to_path_buf(),
        }
    }

    fn discrete_device(&self) -> Option<PciDisplayDevice> {
        scan_display_devices(&self.sysfs_root)
            .into_iter()
            .find(|d| d.vendor == AMD_VENDOR_ID && !d.boot_vga)
    }
}

impl DriverActivityDetector for AmdDetector {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Amd
    }

    fn is_driver_active(&self) -> bool {
        let Some(device) = self.discrete_device() else {
            debug!("No AMD dGPU on the bus");
            return false;
        };

        match read_trimmed(&device.path.join("power/runtime_status")) {
            Some(status) if status == "suspended" => {
                debug!("AMD dGPU {} runtime suspended", device.address);
                false
            }
            Some(status) => {
                debug!("AMD dGPU {} runtime status {}", device.address, status);
                true
            }
            None => {
                warn!(
                    "AMD dGPU {} runtime status unreadable, treating as active",
                    device.address
                );
                true
            }
        }
    }

    fn discrete_pci_address(&self) -> Option<String> {
        self.discrete_device().map(|d| d.address)
    }
}
