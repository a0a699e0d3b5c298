//! Client side of the DBus interface

use crate::{
    args::{Args, Commands},
    errors::{GpuControlError, Result},
    mode::{GpuMode, GpuStatus, GpuSwitchResult, SwitchOutcome},
};
use log::{debug, error};
use zbus::{dbus_proxy, Connection};

const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

#[dbus_proxy(
    interface = "org.asus.GpuSwitch",
    default_service = "org.asus.GpuSwitch",
    default_path = "/org/asus/GpuSwitch"
)]
trait GpuSwitch {
    fn request_mode_switch(&self, mode: &str) -> zbus::Result<(String, String)>;
    fn schedule_mode_for_reboot(&self, mode: &str) -> zbus::Result<(String, String)>;
    fn release_driver_and_apply_eco(&self) -> zbus::Result<(String, String)>;
    fn get_status(&self) -> zbus::Result<GpuStatus>;
    fn get_mode(&self) -> zbus::Result<String>;
}

fn daemon_error(err: zbus::Error) -> GpuControlError {
    match &err {
        zbus::Error::MethodError(name, _, _) if name.as_str() == SERVICE_UNKNOWN => {
            GpuControlError::DaemonNotRunning
        }
        _ => GpuControlError::DBus(err),
    }
}

/// Client for the GPU switch daemon
pub struct GpuSwitchClient {
    proxy: GpuSwitchProxy<'static>,
}

impl GpuSwitchClient {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system().await?;
        let proxy = GpuSwitchProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    /// Handle CLI commands
    pub async fn handle_args(&self, args: Args) -> Result<()> {
        match args.command {
            Commands::Daemon => {
                error!("Daemon command should not be handled by client");
                Err(GpuControlError::Config(
                    "Invalid command for client".to_string(),
                ))
            }
            Commands::Status => self.status().await,
            Commands::Set { mode } => {
                debug!("Requesting {}", mode);
                let (ran, result) = self
                    .proxy
                    .request_mode_switch(mode.as_str())
                    .await
                    .map_err(daemon_error)?;
                report(mode, &ran, &result)
            }
            Commands::Schedule { mode } => {
                debug!("Scheduling {}", mode);
                let (ran, result) = self
                    .proxy
                    .schedule_mode_for_reboot(mode.as_str())
                    .await
                    .map_err(daemon_error)?;
                report(mode, &ran, &result)
            }
            Commands::ReleaseDriver => {
                println!("Releasing the dGPU driver, this can take up to two minutes...");
                let (ran, result) = self
                    .proxy
                    .release_driver_and_apply_eco()
                    .await
                    .map_err(daemon_error)?;
                report(GpuMode::Eco, &ran, &result)
            }
        }
    }

    async fn status(&self) -> Result<()> {
        let mode = self.proxy.get_mode().await.map_err(daemon_error)?;
        let status = self.proxy.get_status().await.map_err(daemon_error)?;
        print!("{}", render_status(&mode, &status));
        Ok(())
    }
}

/// Print the daemon's reply. Under contention the daemon may have run a
/// newer request than `requested`, and the reply names that one.
fn report(requested: GpuMode, ran: &str, result: &str) -> Result<()> {
    let outcome = SwitchOutcome::new(ran.parse()?, result.parse()?);
    if outcome.mode != requested {
        println!("{} was superseded by a later request", requested);
    }
    println!("{}", outcome);
    println!("{}", outcome.result.describe());
    match outcome.result {
        GpuSwitchResult::Failed => Err(GpuControlError::Config(format!(
            "Switching to {} failed",
            outcome.mode
        ))),
        _ => Ok(()),
    }
}

fn render_status(mode: &str, status: &GpuStatus) -> String {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let mut out = format!("Mode:             {}\n", mode);
    if status.mode.is_empty() {
        out.push_str("                  (nothing chosen yet, read from hardware)\n");
    }
    out.push_str(&format!("Auto switching:   {}\n", yes_no(status.auto)));
    out.push_str(&format!("dGPU disabled:    {}\n", yes_no(status.eco_enabled)));
    out.push_str(&format!(
        "MUX:              {} (after reboot: {})\n",
        status.mux_mode, status.effective_mux
    ));
    out.push_str(&format!("Driver active:    {}\n", yes_no(status.driver_active)));
    out.push_str(&format!("On AC:            {}\n", yes_no(status.on_ac)));
    out.push_str(&format!(
        "Boot artifacts:   {}\n",
        yes_no(status.boot_artifacts_present)
    ));
    if status.reboot_pending {
        out.push_str("A reboot is needed to finish the last switch.\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_status() {
        let status = GpuStatus {
            mode: String::new(),
            auto: false,
            eco_enabled: false,
            mux_mode: 0,
            effective_mux: 1,
            driver_active: true,
            on_ac: true,
            boot_artifacts_present: false,
            reboot_pending: true,
        };
        let text = render_status("ultimate", &status);
        assert!(text.contains("Mode:             ultimate"));
        assert!(text.contains("nothing chosen yet"));
        assert!(text.contains("MUX:              0 (after reboot: 1)"));
        assert!(text.contains("A reboot is needed"));
    }

    #[test]
    fn test_report_rejects_unknown_result() {
        assert!(report(GpuMode::Eco, "eco", "applied").is_ok());
        assert!(report(GpuMode::Eco, "eco", "failed").is_err());
        assert!(report(GpuMode::Eco, "eco", "bogus").is_err());
        assert!(report(GpuMode::Eco, "turbo", "applied").is_err());
    }

    #[test]
    fn test_report_accepts_superseding_mode() {
        assert!(report(GpuMode::Eco, "ultimate", "reboot-required").is_ok());
        assert!(report(GpuMode::Eco, "ultimate", "failed").is_err());
    }
}
