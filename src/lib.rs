//! ASUS GPU mode switching
//!
//! Daemon and client for switching ASUS laptops between Eco, Standard,
//! Optimized and Ultimate GPU modes without ever ending up with the display
//! wired to a powered-off dGPU.

pub mod args;
pub mod boot_artifacts;
pub mod client;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod driver;
pub mod errors;
pub mod hardware;
pub mod logging;
pub mod mode;
pub mod power;
pub mod privileged;
pub mod store;

#[cfg(test)]
mod test_support;

// DBus constants
pub const DBUS_SERVICE_NAME: &str = "org.asus.GpuSwitch";
pub const DBUS_OBJECT_PATH: &str = "/org/asus/GpuSwitch";

// Re-export commonly used types
pub use controller::{ControllerParts, ControllerSettings, GpuModeController};
pub use errors::{GpuControlError, Result};
pub use mode::{GpuMode, GpuStatus, GpuSwitchResult, HardwareState, SwitchOutcome};
