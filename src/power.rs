//! AC / battery detection

use log::debug;
use std::fs;
use std::path::PathBuf;

/// Answers whether the machine currently runs on mains power
pub trait PowerSource: Send + Sync {
    fn is_on_ac_power(&self) -> bool;
}

/// Reads `class/power_supply` under a sysfs root
pub struct SysfsPowerSource {
    sysfs_root: PathBuf,
}

impl SysfsPowerSource {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }
}

impl PowerSource for SysfsPowerSource {
    fn is_on_ac_power(&self) -> bool {
        let supplies = self.sysfs_root.join("class/power_supply");
        let Ok(entries) = fs::read_dir(&supplies) else {
            // No power_supply class at all: a desktop, always on mains
            return true;
        };

        let mut saw_mains = false;
        let mut saw_battery = false;
        for entry in entries.flatten() {
            let path = entry.path();
            let supply_type = fs::read_to_string(path.join("type")).unwrap_or_default();
            match supply_type.trim().to_lowercase().as_str() {
                "mains" | "usb" | "usb_pd" => {
                    saw_mains = true;
                    let online = fs::read_to_string(path.join("online")).unwrap_or_default();
                    if online.trim() == "1" {
                        debug!("AC adapter online: {}", path.display());
                        return true;
                    }
                }
                "battery" => saw_battery = true,
                _ => {}
            }
        }

        // Batteryless and no adapter reported: nothing to save power for
        !saw_battery && !saw_mains
    }
}
