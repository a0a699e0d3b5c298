//! Main entry point for the GPU switcher

use asus_gpu_switch::{
    args::{Args, Commands},
    client::GpuSwitchClient,
    config::DaemonConfig,
    daemon::GpuSwitchDaemon,
    logging,
};
use clap::Parser;
use log::LevelFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Print version and build metadata for binary identity verification
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let git_desc = option_env!("GIT_DESC").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    eprintln!(
        "asus-gpu-switch v{} (git {} / {}) built {}",
        pkg_version, git_hash, git_desc, build_time
    );
    let args = Args::parse();

    if let Commands::Daemon = args.command {
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(DaemonConfig::get_config_path);
        let config = DaemonConfig::load(&config_path)?;
        logging::setup(
            logging::level_for(args.verbose, LevelFilter::Info),
            config.log_file.as_deref(),
        )?;

        let daemon = GpuSwitchDaemon::new(config)?;
        return daemon.run().await;
    }

    logging::setup(logging::level_for(args.verbose, LevelFilter::Off), None)?;
    let client = GpuSwitchClient::new().await?;
    client.handle_args(args).await?;

    Ok(())
}
