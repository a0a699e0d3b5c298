//! System bus service owning the GPU mode controller

use crate::{
    boot_artifacts::BootArtifactManager,
    config::DaemonConfig,
    controller::{ControllerParts, GpuModeController},
    driver::{detect_vendor, detector_for, DriverActivityDetector, DriverReleaseHelper},
    errors::{zbus_error_from_display, Result},
    hardware::AsusSysfsGateway,
    mode::{GpuMode, GpuStatus, SwitchOutcome},
    power::{PowerSource, SysfsPowerSource},
    privileged::{PrivilegedExecutor, SystemExecutor},
    store::{JsonSettingsStore, ProcBootId},
    DBUS_OBJECT_PATH, DBUS_SERVICE_NAME,
};
use anyhow::Context;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use zbus::{dbus_interface, ConnectionBuilder, MessageHeader, SignalContext};
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

const SWITCH_POLICY: &str = "org.asus.gpuswitch.switch-mode";
const RELEASE_POLICY: &str = "org.asus.gpuswitch.release-driver";

static CONTINUE: AtomicBool = AtomicBool::new(true);

async fn signal_handling(mut int: Signal, mut hup: Signal, mut term: Signal) {
    let sig = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = hup.recv() => "SIGHUP",
        _ = term.recv() => "SIGTERM"
    };

    info!("caught signal: {}", sig);
    CONTINUE.store(false, Ordering::SeqCst);
}

/// Ask polkit whether the caller of the current message may perform `action`
async fn authorize(
    context: &SignalContext<'_>,
    header: &MessageHeader<'_>,
    action: &str,
) -> zbus::fdo::Result<()> {
    let polkit = AuthorityProxy::new(context.connection())
        .await
        .context("could not connect to polkit authority daemon")
        .map_err(zbus_error_from_display)?;

    let subject = Subject::new_for_message_header(header)
        .context("could not create policykit1 subject")
        .map_err(zbus_error_from_display)?;

    let permitted = polkit
        .check_authorization(
            &subject,
            action,
            &HashMap::new(),
            CheckAuthorizationFlags::AllowUserInteraction.into(),
            "",
        )
        .await
        .context("could not check policykit authorization")
        .map_err(zbus_error_from_display)?
        .is_authorized;

    if permitted {
        Ok(())
    } else {
        warn!("polkit denied {}", action);
        Err(zbus::fdo::Error::AccessDenied(format!(
            "Operation not permitted by Polkit: {}",
            action
        )))
    }
}

/// Run a controller operation off the async runtime
async fn blocking<T, F>(controller: &Arc<GpuModeController>, op: F) -> zbus::fdo::Result<T>
where
    F: FnOnce(&GpuModeController) -> T + Send + 'static,
    T: Send + 'static,
{
    let controller = controller.clone();
    tokio::task::spawn_blocking(move || op(&controller))
        .await
        .map_err(zbus_error_from_display)
}

/// DBus face of the controller
pub struct GpuSwitchInterface {
    controller: Arc<GpuModeController>,
}

impl GpuSwitchInterface {
    /// Emit the outcome and hand it back as the method's (mode, result) reply
    async fn announce(context: &SignalContext<'_>, outcome: SwitchOutcome) -> (String, String) {
        let mode = outcome.mode.as_str();
        let result = outcome.result.as_str();
        if let Err(e) = Self::switch_completed(context, mode, result).await {
            warn!("Failed to emit SwitchCompleted: {}", e);
        }
        (mode.to_string(), result.to_string())
    }
}

#[dbus_interface(name = "org.asus.GpuSwitch")]
impl GpuSwitchInterface {
    /// Emitted after every mutating call with the mode that ran and its outcome
    #[dbus_interface(signal)]
    async fn switch_completed(
        context: &SignalContext<'_>,
        mode: &str,
        result: &str,
    ) -> zbus::Result<()>;

    async fn request_mode_switch(
        &self,
        mode: &str,
        #[zbus(header)] header: MessageHeader<'_>,
        #[zbus(signal_context)] context: SignalContext<'_>,
    ) -> zbus::fdo::Result<(String, String)> {
        let target: GpuMode = mode.parse().map_err(zbus_error_from_display)?;
        authorize(&context, &header, SWITCH_POLICY).await?;

        let outcome = blocking(&self.controller, move |c| c.request_mode_switch(target)).await?;
        Ok(Self::announce(&context, outcome).await)
    }

    async fn schedule_mode_for_reboot(
        &self,
        mode: &str,
        #[zbus(header)] header: MessageHeader<'_>,
        #[zbus(signal_context)] context: SignalContext<'_>,
    ) -> zbus::fdo::Result<(String, String)> {
        let target: GpuMode = mode.parse().map_err(zbus_error_from_display)?;
        authorize(&context, &header, SWITCH_POLICY).await?;

        let outcome =
            blocking(&self.controller, move |c| c.schedule_mode_for_reboot(target)).await?;
        Ok(Self::announce(&context, outcome).await)
    }

    async fn release_driver_and_apply_eco(
        &self,
        #[zbus(header)] header: MessageHeader<'_>,
        #[zbus(signal_context)] context: SignalContext<'_>,
    ) -> zbus::fdo::Result<(String, String)> {
        authorize(&context, &header, RELEASE_POLICY).await?;

        let outcome = blocking(&self.controller, |c| c.release_driver_and_apply_eco()).await?;
        Ok(Self::announce(&context, outcome).await)
    }

    async fn get_status(&self) -> zbus::fdo::Result<GpuStatus> {
        debug!("Getting GPU status");
        blocking(&self.controller, |c| c.status())
            .await?
            .map_err(zbus_error_from_display)
    }

    async fn get_mode(&self) -> zbus::fdo::Result<String> {
        blocking(&self.controller, |c| c.current_mode())
            .await?
            .map(|mode| mode.as_str().to_string())
            .map_err(zbus_error_from_display)
    }
}

/// The daemon process: controller, DBus service and power watcher
pub struct GpuSwitchDaemon {
    controller: Arc<GpuModeController>,
    power: Arc<dyn PowerSource>,
    config: DaemonConfig,
}

impl GpuSwitchDaemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let sysfs_root = config.sysfs_root.as_path();
        let vendor = match config.vendor {
            Some(vendor) => {
                info!("Using configured dGPU vendor {:?}", vendor);
                vendor
            }
            None => detect_vendor(sysfs_root),
        };

        let detector: Arc<dyn DriverActivityDetector> = Arc::from(detector_for(vendor, sysfs_root));
        let executor: Arc<dyn PrivilegedExecutor> = Arc::new(SystemExecutor::detect());
        let power: Arc<dyn PowerSource> = Arc::new(SysfsPowerSource::new(sysfs_root));

        let parts = ControllerParts {
            hardware: Arc::new(AsusSysfsGateway::new(sysfs_root, detector.clone())),
            power: power.clone(),
            store: Arc::new(JsonSettingsStore::open(&config.state_path)?),
            boot_id: Arc::new(ProcBootId::new()),
            detector: detector.clone(),
            release: DriverReleaseHelper::new(
                detector,
                executor.clone(),
                config.release_timeout(),
            ),
            artifacts: BootArtifactManager::new(
                config.artifacts.clone(),
                vendor,
                executor,
                config.artifact_timeout(),
            ),
        };

        Ok(Self {
            controller: Arc::new(GpuModeController::new(parts, config.controller_settings())),
            power,
            config,
        })
    }

    /// Reconcile, serve until a signal arrives, then make the shutdown attempt
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting GPU switch daemon");
        let int = signal(SignalKind::interrupt()).context("unable to watch SIGINT")?;
        let hup = signal(SignalKind::hangup()).context("unable to watch SIGHUP")?;
        let term = signal(SignalKind::terminate()).context("unable to watch SIGTERM")?;

        // hardware must be consistent before anyone can ask for a switch
        let startup = blocking(&self.controller, |c| c.apply_pending_on_startup())
            .await
            .context("startup reconciliation panicked")?;
        info!("Startup reconciliation: {}", startup);

        info!("Registering {} DBus interface", DBUS_SERVICE_NAME);
        let _connection = ConnectionBuilder::system()
            .context("failed to create zbus connection builder")?
            .name(DBUS_SERVICE_NAME)
            .context("unable to register name")?
            .serve_at(
                DBUS_OBJECT_PATH,
                GpuSwitchInterface {
                    controller: self.controller.clone(),
                },
            )
            .context("unable to serve")?
            .build()
            .await
            .context("unable to create system service")?;
        info!("Registered {} DBus interface", DBUS_SERVICE_NAME);

        let controller = self.controller.clone();
        let power = self.power.clone();
        let interval = self.config.power_poll_interval();

        let main_loop = async move {
            let mut last_on_ac = power.is_on_ac_power();
            let mut switches: Vec<JoinHandle<SwitchOutcome>> = Vec::new();

            while CONTINUE.load(Ordering::SeqCst) {
                sleep(interval).await;
                switches.retain(|handle| !handle.is_finished());

                let on_ac = power.is_on_ac_power();
                if on_ac == last_on_ac {
                    continue;
                }
                last_on_ac = on_ac;
                info!("Power source changed, on AC: {}", on_ac);

                let controller = controller.clone();
                switches.push(tokio::task::spawn_blocking(move || {
                    let outcome = controller.auto_gpu_switch();
                    info!("Auto GPU switch: {}", outcome);
                    outcome
                }));
            }

            for handle in switches {
                if let Err(e) = handle.await {
                    error!("Auto GPU switch task failed: {}", e);
                }
            }
        };

        info!("Handling dbus requests");
        tokio::join!(signal_handling(int, hup, term), main_loop);

        match blocking(&self.controller, |c| c.apply_pending_on_shutdown()).await {
            Ok(result) => info!("Shutdown attempt: {}", result),
            Err(e) => error!("Shutdown attempt failed: {}", e),
        }

        info!("daemon exited from loop");
        Ok(())
    }
}
