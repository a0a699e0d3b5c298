//! GPU modes, hardware targets and switch outcomes

use crate::errors::GpuControlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zvariant::Type;

/// `gpu_mux_mode` value routing the panel straight to the dGPU
pub const MUX_DISCRETE: u8 = 0;
/// `gpu_mux_mode` value for hybrid wiring through the iGPU
pub const MUX_HYBRID: u8 = 1;

/// User-facing GPU mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    /// dGPU powered off, iGPU drives the display
    Eco,
    /// dGPU powered, hybrid wiring
    Standard,
    /// Eco on battery, Standard on AC
    Optimized,
    /// Display wired to the dGPU
    Ultimate,
}

impl GpuMode {
    pub const ALL: [GpuMode; 4] = [Self::Eco, Self::Standard, Self::Optimized, Self::Ultimate];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eco => "eco",
            Self::Standard => "standard",
            Self::Optimized => "optimized",
            Self::Ultimate => "ultimate",
        }
    }

    /// Hardware state this mode resolves to for the given power source
    pub fn hardware_target(self, on_ac: bool) -> HardwareState {
        match self {
            Self::Eco => HardwareState::new(true, MUX_HYBRID),
            Self::Standard => HardwareState::new(false, MUX_HYBRID),
            Self::Optimized => HardwareState::new(!on_ac, MUX_HYBRID),
            Self::Ultimate => HardwareState::new(false, MUX_DISCRETE),
        }
    }
}

impl fmt::Display for GpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuMode {
    type Err = GpuControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eco" => Ok(Self::Eco),
            "standard" => Ok(Self::Standard),
            "optimized" => Ok(Self::Optimized),
            "ultimate" => Ok(Self::Ultimate),
            other => Err(GpuControlError::InvalidMode(other.to_string())),
        }
    }
}

/// Pair of raw hardware attributes, live or targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareState {
    /// `dgpu_disable` is set
    pub eco_enabled: bool,
    pub mux_mode: u8,
}

impl HardwareState {
    pub fn new(eco_enabled: bool, mux_mode: u8) -> Self {
        Self {
            eco_enabled,
            mux_mode,
        }
    }

    /// MUX on the dGPU while the dGPU is off: no display after reboot
    pub fn is_impossible(&self) -> bool {
        self.mux_mode == MUX_DISCRETE && self.eco_enabled
    }

    /// Mode the hardware currently reflects
    pub fn observed_mode(&self, auto: bool) -> GpuMode {
        if self.mux_mode == MUX_DISCRETE {
            GpuMode::Ultimate
        } else if auto {
            GpuMode::Optimized
        } else if self.eco_enabled {
            GpuMode::Eco
        } else {
            GpuMode::Standard
        }
    }
}

/// Outcome of one switch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuSwitchResult {
    /// Hardware changed live and verified
    Applied,
    /// Hardware already matched the target
    AlreadySet,
    /// MUX change written, takes effect after reboot
    RebootRequired,
    /// dGPU driver holds the device, eco write not attempted
    DriverBlocking,
    /// Another switch is running, target recorded as the next one
    Deferred,
    /// Eco would combine with a MUX latched to the dGPU
    EcoBlocked,
    Failed,
}

impl GpuSwitchResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadySet => "already-set",
            Self::RebootRequired => "reboot-required",
            Self::DriverBlocking => "driver-blocking",
            Self::Deferred => "deferred",
            Self::EcoBlocked => "eco-blocked",
            Self::Failed => "failed",
        }
    }

    /// Whether the requested mode is recorded as the persisted choice
    pub fn persists_mode(self) -> bool {
        matches!(
            self,
            Self::Applied | Self::AlreadySet | Self::RebootRequired | Self::DriverBlocking
        )
    }

    /// Next step for the user, as shown by the CLI
    pub fn describe(self) -> &'static str {
        match self {
            Self::Applied => "GPU mode applied.",
            Self::AlreadySet => "GPU is already in the requested mode.",
            Self::RebootRequired => "Reboot to finish switching the GPU mode.",
            Self::DriverBlocking => {
                "The dGPU driver is in use. Close GPU applications, force a driver \
                 release, or schedule the mode for the next boot."
            }
            Self::Deferred => "Another switch is in progress; this mode will be applied next.",
            Self::EcoBlocked => {
                "Eco is unavailable until reboot: the MUX was set to the dGPU during this boot."
            }
            Self::Failed => "Switching failed. Check the daemon log for details.",
        }
    }
}

impl fmt::Display for GpuSwitchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuSwitchResult {
    type Err = GpuControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Applied,
            Self::AlreadySet,
            Self::RebootRequired,
            Self::DriverBlocking,
            Self::Deferred,
            Self::EcoBlocked,
            Self::Failed,
        ]
        .into_iter()
        .find(|result| result.as_str() == s)
        .ok_or_else(|| GpuControlError::Config(format!("Unknown switch result: {}", s)))
    }
}

/// A switch result and the mode it was computed for. Under contention this
/// is the mode of the last request drained, not necessarily the caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub mode: GpuMode,
    pub result: GpuSwitchResult,
}

impl SwitchOutcome {
    pub fn new(mode: GpuMode, result: GpuSwitchResult) -> Self {
        Self { mode, result }
    }
}

impl fmt::Display for SwitchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.mode, self.result)
    }
}

/// Snapshot returned by the status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct GpuStatus {
    /// Persisted mode, empty when nothing was ever chosen
    pub mode: String,
    pub auto: bool,
    pub eco_enabled: bool,
    pub mux_mode: u8,
    pub effective_mux: u8,
    pub driver_active: bool,
    pub on_ac: bool,
    pub boot_artifacts_present: bool,
    pub reboot_pending: bool,
}
