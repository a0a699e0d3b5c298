//! Persistent key-value state and the boot identifier

use crate::errors::{GpuControlError, Result};
use log::{debug, error, warn};
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Last mode the user targeted
pub const KEY_GPU_MODE: &str = "gpu_mode";
/// Optimized flag
pub const KEY_GPU_AUTO: &str = "gpu_auto";
/// Boot id under which the MUX was last latched to the dGPU
pub const KEY_MUX_ZERO_BOOT_ID: &str = "mux_zero_latched_boot_id";
/// Boot id under which the MUX was last written at all
pub const KEY_MUX_WRITTEN_BOOT_ID: &str = "mux_written_boot_id";

/// Persistent string/bool settings
pub trait SettingsStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn set_bool(&self, key: &str, value: bool) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Settings kept in a JSON object on disk, rewritten atomically on every change
pub struct JsonSettingsStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonSettingsStore {
    /// Open the store, starting empty when the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let json = fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&json)? {
                Value::Object(map) => map,
                _ => {
                    return Err(GpuControlError::Config(format!(
                        "State file {} is not a JSON object",
                        path.display()
                    )))
                }
            }
        } else {
            debug!("No state file at {}, starting empty", path.display());
            Map::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn update(&self, change: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut values);
        self.save_with_retry(&values)
    }

    fn save_with_retry(&self, values: &Map<String, Value>) -> Result<()> {
        let mut retries = 3;
        loop {
            match self.save(values) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    retries -= 1;
                    if retries == 0 {
                        error!("Failed to save state after all retries: {}", e);
                        return Err(e);
                    }
                    warn!("Failed to save state, retrying... ({} attempts left): {}", retries, e);
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
    }

    fn save(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string_pretty(values)?;
        fs::write(&temp_path, json)?;

        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            GpuControlError::Io(e)
        })?;

        debug!("State saved to {}", self.path.display());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), Value::String(value.to_string()));
        })
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), Value::Bool(value));
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.get(key).is_none() {
            return Ok(());
        }
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Source of an identifier unique to the current boot
pub trait BootIdSource: Send + Sync {
    fn boot_id(&self) -> Option<String>;
}

/// Kernel-provided boot id
pub struct ProcBootId {
    path: PathBuf,
}

impl ProcBootId {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/sys/kernel/random/boot_id"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcBootId {
    fn default() -> Self {
        Self::new()
    }
}

impl BootIdSource for ProcBootId {
    fn boot_id(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(id) => Some(id.trim().to_string()).filter(|id| !id.is_empty()),
            Err(e) => {
                warn!("Unable to read boot id from {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
