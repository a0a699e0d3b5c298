//! Forced teardown of the dGPU driver

use super::{DriverActivityDetector, GpuVendor};
use crate::errors::{GpuControlError, Result};
use crate::privileged::{shell_quote, PrivilegedExecutor};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Unload order matters: dependents first
const NVIDIA_MODULE_CHAIN: [&str; 4] = ["nvidia_drm", "nvidia_modeset", "nvidia_uvm", "nvidia"];
const NVIDIA_SERVICES: [&str; 2] = ["nvidia-persistenced.service", "nvidia-powerd.service"];

/// Unloads or unbinds the dGPU driver, then confirms with the detector
pub struct DriverReleaseHelper {
    detector: Arc<dyn DriverActivityDetector>,
    executor: Arc<dyn PrivilegedExecutor>,
    timeout: Duration,
}

impl DriverReleaseHelper {
    pub fn new(
        detector: Arc<dyn DriverActivityDetector>,
        executor: Arc<dyn PrivilegedExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            detector,
            executor,
            timeout,
        }
    }

    /// Script tearing down the driver for the detected vendor
    pub fn release_script(&self) -> Option<String> {
        match self.detector.vendor() {
            GpuVendor::Nvidia => Some(format!(
                "systemctl stop {} 2>/dev/null\nmodprobe -r {}",
                NVIDIA_SERVICES.join(" "),
                NVIDIA_MODULE_CHAIN.join(" ")
            )),
            GpuVendor::Amd => {
                let address = self.detector.discrete_pci_address()?;
                let device = format!("/sys/bus/pci/devices/{}", address);
                Some(format!(
                    "if [ -e {dev}/driver ]; then echo {addr} > {dev}/driver/unbind; fi\n\
                     echo 1 > {dev}/remove",
                    dev = shell_quote(&device),
                    addr = shell_quote(&address),
                ))
            }
        }
    }

    /// Best-effort forced release. Success means the detector reports idle
    /// afterwards, regardless of the helper's exit code.
    pub fn release(&self) -> Result<()> {
        if !self.detector.is_driver_active() {
            info!("dGPU driver already idle, nothing to release");
            return Ok(());
        }

        let Some(script) = self.release_script() else {
            warn!("No dGPU device found to release");
            return Err(GpuControlError::DriverStillActive);
        };

        info!(
            "Releasing {:?} dGPU driver (timeout {:?})",
            self.detector.vendor(),
            self.timeout
        );
        match self.executor.run(&script, self.timeout) {
            Ok(output) if !output.success() => warn!(
                "Driver release helper exited with {:?}: {}",
                output.code,
                output.stderr.trim()
            ),
            Ok(_) => {}
            Err(e) => warn!("Driver release helper failed: {}", e),
        }

        if self.detector.is_driver_active() {
            warn!("dGPU driver still active after release attempt");
            Err(GpuControlError::DriverStillActive)
        } else {
            info!("dGPU driver released");
            Ok(())
        }
    }
}
