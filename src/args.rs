//! Command line argument parsing

use crate::mode::GpuMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ASUS GPU mode switcher
///
/// Switches between Eco, Standard, Optimized and Ultimate without ever
/// leaving the machine without a display.
#[derive(Parser)]
#[command(name = "asus-gpu-switch")]
#[command(about = "Safe dGPU power and MUX switching for ASUS laptops")]
#[command(version)]
pub struct Args {
    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Daemon configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon
    Daemon,
    /// Show hardware state and the persisted mode
    Status,
    /// Switch mode now, as far as the hardware allows
    Set {
        /// eco, standard, optimized or ultimate
        mode: GpuMode,
    },
    /// Apply a mode on the next boot
    Schedule {
        /// eco, standard, optimized or ultimate
        mode: GpuMode,
    },
    /// Force the dGPU driver off the device, then enter Eco
    ReleaseDriver,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set() {
        let args = Args::parse_from(["asus-gpu-switch", "-vv", "set", "Ultimate"]);
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Commands::Set { mode: GpuMode::Ultimate }));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(Args::try_parse_from(["asus-gpu-switch", "schedule", "turbo"]).is_err());
    }

    #[test]
    fn test_config_after_subcommand() {
        let args = Args::parse_from(["asus-gpu-switch", "daemon", "--config", "/tmp/gpu.json"]);
        assert!(matches!(args.command, Commands::Daemon));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/gpu.json")));
    }
}
