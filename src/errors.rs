//! Error types for the GPU switching daemon

use std::time::Duration;
use thiserror::Error;

/// Result type alias for the GPU switching daemon
pub type Result<T> = std::result::Result<T, GpuControlError>;

/// Main error type for the GPU switching daemon
#[derive(Error, Debug)]
pub enum GpuControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("DBus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hardware attribute not supported: {attribute}")]
    Unsupported { attribute: &'static str },

    #[error("Firmware rejected write of {value} to {attribute}: {source}")]
    HardwareRejected {
        attribute: &'static str,
        value: String,
        source: std::io::Error,
    },

    #[error("Refusing to disable the dGPU while its display driver is bound")]
    DriverBound,

    #[error("Refusing to change the GPU MUX while the dGPU is powered off")]
    MuxWhileDgpuOff,

    #[error("Readback mismatch on {attribute}: wrote {expected}, read {actual}")]
    ReadbackMismatch {
        attribute: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Privileged command failed ({code:?}): {stderr}")]
    PrivilegedFailed { code: Option<i32>, stderr: String },

    #[error("Privileged command timed out after {0:?}")]
    PrivilegedTimeout(Duration),

    #[error("dGPU driver is still active after release attempt")]
    DriverStillActive,

    #[error("Invalid GPU mode: {0}")]
    InvalidMode(String),

    #[error("Daemon not running")]
    DaemonNotRunning,
}

/// Helper function to convert display errors to zbus errors
pub fn zbus_error_from_display(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}", err))
}
