//! dGPU driver activity detection, per vendor family

mod amd;
mod nvidia;
pub mod release;

pub use amd::AmdDetector;
pub use nvidia::NvidiaDetector;
pub use release::DriverReleaseHelper;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const NVIDIA_VENDOR_ID: &str = "0x10de";
pub const AMD_VENDOR_ID: &str = "0x1002";

/// Vendor family of the discrete GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

/// Reports whether the dGPU's kernel driver holds display resources
pub trait DriverActivityDetector: Send + Sync {
    fn vendor(&self) -> GpuVendor;

    /// Fail-safe: anything unreadable counts as active
    fn is_driver_active(&self) -> bool;

    /// PCI address of the dGPU, when it is on the bus
    fn discrete_pci_address(&self) -> Option<String>;
}

/// Build the detector matching `vendor`
pub fn detector_for(vendor: GpuVendor, sysfs_root: &Path) -> Box<dyn DriverActivityDetector> {
    match vendor {
        GpuVendor::Nvidia => Box::new(NvidiaDetector::new(sysfs_root)),
        GpuVendor::Amd => Box::new(AmdDetector::new(sysfs_root)),
    }
}

/// Display-class PCI function, as found under `bus/pci/devices`
#[derive(Debug, Clone)]
pub(crate) struct PciDisplayDevice {
    pub path: PathBuf,
    pub address: String,
    pub vendor: String,
    pub boot_vga: bool,
}

/// All display controllers (class 0x03xxxx) on the bus
pub(crate) fn scan_display_devices(sysfs_root: &Path) -> Vec<PciDisplayDevice> {
    let devices_dir = sysfs_root.join("bus/pci/devices");
    let Ok(entries) = fs::read_dir(&devices_dir) else {
        debug!("No PCI devices under {}", devices_dir.display());
        return Vec::new();
    };

    let mut devices: Vec<PciDisplayDevice> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let class = read_trimmed(&path.join("class"))?;
            if !class.starts_with("0x03") {
                return None;
            }
            let vendor = read_trimmed(&path.join("vendor"))?;
            let boot_vga = read_trimmed(&path.join("boot_vga")).as_deref() == Some("1");
            Some(PciDisplayDevice {
                address: entry.file_name().to_string_lossy().to_string(),
                path,
                vendor,
                boot_vga,
            })
        })
        .collect();

    devices.sort_by(|a, b| a.address.cmp(&b.address));
    devices
}

pub(crate) fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Guess the dGPU vendor family from the bus and loaded modules
pub fn detect_vendor(sysfs_root: &Path) -> GpuVendor {
    let devices = scan_display_devices(sysfs_root);

    if devices.iter().any(|d| d.vendor == NVIDIA_VENDOR_ID) {
        info!("Detected NVIDIA dGPU on the PCI bus");
        return GpuVendor::Nvidia;
    }
    if devices
        .iter()
        .any(|d| d.vendor == AMD_VENDOR_ID && !d.boot_vga)
    {
        info!("Detected AMD dGPU on the PCI bus");
        return GpuVendor::Amd;
    }
    if sysfs_root.join("module/nvidia").exists() {
        info!("dGPU not on the bus, nvidia module loaded");
        return GpuVendor::Nvidia;
    }

    info!("dGPU not visible (likely powered off), assuming NVIDIA");
    GpuVendor::Nvidia
}
