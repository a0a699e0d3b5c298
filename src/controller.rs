//! GPU mode state machine
//!
//! All hardware writes go through [`GpuModeController`]. It keeps two
//! attributes consistent: `dgpu_disable` (Eco) and `gpu_mux_mode`. A MUX
//! write only lands on the next boot, so the controller latches the value it
//! wrote and treats that as the effective MUX for the rest of the boot. Eco
//! is never combined with a MUX routed to the dGPU, live or latched.
//!
//! Switches are single-flight. A caller that finds a switch running records
//! its target in a one-entry pending slot and returns `Deferred`; the running
//! caller drains the slot before releasing the lock, so the last request wins.

use crate::boot_artifacts::BootArtifactManager;
use crate::driver::{DriverActivityDetector, DriverReleaseHelper};
use crate::errors::{GpuControlError, Result};
use crate::hardware::{HardwareGateway, DGPU_DISABLE};
use crate::mode::{
    GpuMode, GpuStatus, GpuSwitchResult, HardwareState, SwitchOutcome, MUX_DISCRETE, MUX_HYBRID,
};
use crate::power::PowerSource;
use crate::store::{
    BootIdSource, SettingsStore, KEY_GPU_AUTO, KEY_GPU_MODE, KEY_MUX_WRITTEN_BOOT_ID,
    KEY_MUX_ZERO_BOOT_ID,
};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

/// Timing knobs for the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Wait between an eco write and its readback
    pub settle_delay: Duration,
    /// Wait before acting on a power change, so flapping collapses
    pub auto_settle: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1500),
            auto_settle: Duration::from_millis(1000),
        }
    }
}

/// Collaborators the controller is built from
pub struct ControllerParts {
    pub hardware: Arc<dyn HardwareGateway>,
    pub power: Arc<dyn PowerSource>,
    pub store: Arc<dyn SettingsStore>,
    pub boot_id: Arc<dyn BootIdSource>,
    pub detector: Arc<dyn DriverActivityDetector>,
    pub release: DriverReleaseHelper,
    pub artifacts: BootArtifactManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingSwitch {
    Request(GpuMode),
    Schedule(GpuMode),
    ReleaseAndEco,
    Auto,
}

impl PendingSwitch {
    fn mode(self) -> GpuMode {
        match self {
            Self::Request(mode) | Self::Schedule(mode) => mode,
            Self::ReleaseAndEco => GpuMode::Eco,
            Self::Auto => GpuMode::Optimized,
        }
    }
}

/// MUX writes made by this process during the current boot
#[derive(Debug, Clone, Copy, Default)]
struct MuxLatch {
    /// Last value written
    written: Option<u8>,
    /// The dGPU value was written at some point
    discrete: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct GpuModeController {
    hardware: Arc<dyn HardwareGateway>,
    power: Arc<dyn PowerSource>,
    store: Arc<dyn SettingsStore>,
    boot_id: Arc<dyn BootIdSource>,
    detector: Arc<dyn DriverActivityDetector>,
    release: DriverReleaseHelper,
    artifacts: BootArtifactManager,
    settings: ControllerSettings,
    switch_lock: Mutex<()>,
    pending: Mutex<Option<PendingSwitch>>,
    mux_latch: Mutex<MuxLatch>,
}

impl GpuModeController {
    pub fn new(parts: ControllerParts, settings: ControllerSettings) -> Self {
        Self {
            hardware: parts.hardware,
            power: parts.power,
            store: parts.store,
            boot_id: parts.boot_id,
            detector: parts.detector,
            release: parts.release,
            artifacts: parts.artifacts,
            settings,
            switch_lock: Mutex::new(()),
            pending: Mutex::new(None),
            mux_latch: Mutex::new(MuxLatch::default()),
        }
    }

    /// Switch to `target` now, as far as the hardware allows this boot
    pub fn request_mode_switch(&self, target: GpuMode) -> SwitchOutcome {
        info!("Mode switch to {} requested", target);
        if self.targets_eco(target) && self.mux_zero_guard_tripped() {
            warn!("Refusing {}: MUX was set to the dGPU during this boot", target);
            return SwitchOutcome::new(target, GpuSwitchResult::EcoBlocked);
        }
        self.submit(PendingSwitch::Request(target))
    }

    /// Record `target` for the next boot, writing boot artifacts for Eco
    pub fn schedule_mode_for_reboot(&self, target: GpuMode) -> SwitchOutcome {
        info!("Scheduling {} for the next boot", target);
        if self.targets_eco(target) && self.mux_zero_guard_tripped() {
            warn!("Refusing to schedule {}: MUX was set to the dGPU during this boot", target);
            return SwitchOutcome::new(target, GpuSwitchResult::EcoBlocked);
        }
        self.submit(PendingSwitch::Schedule(target))
    }

    /// Force the dGPU driver off the device, then enter Eco
    pub fn release_driver_and_apply_eco(&self) -> SwitchOutcome {
        info!("Driver release and Eco requested");
        if self.mux_zero_guard_tripped() {
            warn!("Refusing driver release: MUX was set to the dGPU during this boot");
            return SwitchOutcome::new(GpuMode::Eco, GpuSwitchResult::EcoBlocked);
        }
        self.submit(PendingSwitch::ReleaseAndEco)
    }

    /// Re-evaluate Optimized after a power source change. No-op unless auto
    /// mode is on.
    pub fn auto_gpu_switch(&self) -> SwitchOutcome {
        if !self.is_auto_enabled() {
            debug!("Auto GPU switching disabled");
            return SwitchOutcome::new(GpuMode::Optimized, GpuSwitchResult::AlreadySet);
        }
        self.submit(PendingSwitch::Auto)
    }

    /// Reconcile persisted mode with the hardware at service start.
    /// Never fails; every problem is logged.
    pub fn apply_pending_on_startup(&self) -> GpuSwitchResult {
        let Some(_guard) = self.try_acquire() else {
            warn!("Switch already running at startup");
            return GpuSwitchResult::Deferred;
        };

        self.recover_boot_safety();
        self.clear_stale_mux_markers();

        let Some(mode) = self.persisted_mode() else {
            info!("No persisted GPU mode");
            return GpuSwitchResult::AlreadySet;
        };
        let state = match self.hardware.read_state() {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to read GPU state at startup: {}", e);
                return GpuSwitchResult::Failed;
            }
        };
        let desired = mode.hardware_target(self.power.is_on_ac_power());
        let effective_mux = self.effective_mux(state.mux_mode);
        info!(
            "Startup: persisted {} mode, hardware eco={} mux={}",
            mode, state.eco_enabled, state.mux_mode
        );

        if desired.mux_mode != effective_mux {
            if let Err(result) = self.change_mux(state, desired.mux_mode) {
                return result;
            }
            if !desired.eco_enabled {
                self.cleanup_artifacts();
            }
            return GpuSwitchResult::RebootRequired;
        }

        if state.eco_enabled == desired.eco_enabled {
            self.cleanup_artifacts();
            return GpuSwitchResult::AlreadySet;
        }
        if !desired.eco_enabled {
            return self.enable_dgpu();
        }
        if self.mux_written_this_boot() {
            info!("MUX written earlier in this boot, Eco waits for the reboot");
            return GpuSwitchResult::RebootRequired;
        }

        let result = self.disable_dgpu(state);
        if result == GpuSwitchResult::DriverBlocking && mode == GpuMode::Eco {
            // try again on the next boot, with the driver kept away
            let address = self.detector.discrete_pci_address();
            if let Err(e) = self.artifacts.write_driver_block(mode, address.as_deref()) {
                warn!("Could not write boot artifacts: {}", e);
            }
        }
        result
    }

    /// Last chance to enter a pending Eco before power-off, while the
    /// driver may already be gone. Anything short of success is left to the
    /// next startup.
    pub fn apply_pending_on_shutdown(&self) -> GpuSwitchResult {
        let Some(_guard) = self.try_acquire() else {
            info!("Switch running at shutdown, leaving pending work to startup");
            return GpuSwitchResult::Deferred;
        };

        let Some(mode) = self.persisted_mode() else {
            return GpuSwitchResult::AlreadySet;
        };
        if !mode.hardware_target(self.power.is_on_ac_power()).eco_enabled {
            return GpuSwitchResult::AlreadySet;
        }
        let state = match self.hardware.read_state() {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to read GPU state at shutdown: {}", e);
                return GpuSwitchResult::Failed;
            }
        };
        if state.eco_enabled {
            return GpuSwitchResult::AlreadySet;
        }
        if state.mux_mode != MUX_HYBRID
            || self.effective_mux(state.mux_mode) != MUX_HYBRID
            || self.mux_written_this_boot()
            || self.mux_zero_guard_tripped()
        {
            info!("MUX not settled on hybrid, Eco left to startup");
            return GpuSwitchResult::Deferred;
        }

        let result = self.disable_dgpu(state);
        match result {
            GpuSwitchResult::Applied => info!("Eco applied at shutdown"),
            other => info!("Eco not applied at shutdown ({}), startup will retry", other),
        }
        result
    }

    pub fn status(&self) -> Result<GpuStatus> {
        let state = self.hardware.read_state()?;
        let effective_mux = self.effective_mux(state.mux_mode);
        Ok(GpuStatus {
            mode: self
                .persisted_mode()
                .map(|mode| mode.as_str().to_string())
                .unwrap_or_default(),
            auto: self.is_auto_enabled(),
            eco_enabled: state.eco_enabled,
            mux_mode: state.mux_mode,
            effective_mux,
            driver_active: self.detector.is_driver_active(),
            on_ac: self.power.is_on_ac_power(),
            boot_artifacts_present: self.artifacts.any_present(),
            reboot_pending: effective_mux != state.mux_mode || self.mux_written_this_boot(),
        })
    }

    /// Mode the user last chose. Falls back to the boot trigger file.
    pub fn persisted_mode(&self) -> Option<GpuMode> {
        if self.is_auto_enabled() {
            return Some(GpuMode::Optimized);
        }
        match self.store.get_string(KEY_GPU_MODE) {
            Some(value) => match value.parse() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    warn!("Ignoring persisted GPU mode: {}", e);
                    None
                }
            },
            None => self.artifacts.pending_trigger(),
        }
    }

    /// Persisted mode, or what the hardware reflects when nothing was chosen
    pub fn current_mode(&self) -> Result<GpuMode> {
        match self.persisted_mode() {
            Some(mode) => Ok(mode),
            None => Ok(self.hardware.read_state()?.observed_mode(false)),
        }
    }

    pub fn is_auto_enabled(&self) -> bool {
        self.store.get_bool(KEY_GPU_AUTO).unwrap_or(false)
    }

    fn targets_eco(&self, target: GpuMode) -> bool {
        target.hardware_target(self.power.is_on_ac_power()).eco_enabled
    }

    fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match self.switch_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn offer(&self, job: PendingSwitch) {
        let mut pending = lock(&self.pending);
        match (job, *pending) {
            (PendingSwitch::Auto, Some(existing)) => {
                debug!("Power change folded into pending {:?}", existing)
            }
            _ => {
                if let Some(previous) = pending.replace(job) {
                    info!("Pending {:?} superseded by {:?}", previous, job);
                }
            }
        }
    }

    fn take_pending(&self) -> Option<PendingSwitch> {
        lock(&self.pending).take()
    }

    fn has_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Run `job`, or leave it for the current lock holder. The holder drains
    /// the slot and reports the last job it ran.
    fn submit(&self, job: PendingSwitch) -> SwitchOutcome {
        self.offer(job);

        let mut outcome = SwitchOutcome::new(job.mode(), GpuSwitchResult::Deferred);
        loop {
            let Some(guard) = self.try_acquire() else {
                if outcome.result == GpuSwitchResult::Deferred {
                    info!("Switch in progress, {:?} will run next", job);
                }
                return outcome;
            };
            while let Some(next) = self.take_pending() {
                outcome = SwitchOutcome::new(next.mode(), self.execute(next));
                info!("{:?} finished: {}", next, outcome.result);
            }
            drop(guard);

            // a request may have landed between the last take and the unlock
            if !self.has_pending() {
                return outcome;
            }
        }
    }

    fn execute(&self, job: PendingSwitch) -> GpuSwitchResult {
        match job {
            PendingSwitch::Request(target) => self.switch_locked(target),
            PendingSwitch::Schedule(target) => self.schedule_locked(target),
            PendingSwitch::ReleaseAndEco => self.release_locked(),
            PendingSwitch::Auto => self.auto_switch_locked(),
        }
    }

    fn read_state_or_fail(&self) -> std::result::Result<HardwareState, GpuSwitchResult> {
        self.hardware.read_state().map_err(|e| {
            error!("Failed to read GPU state: {}", e);
            GpuSwitchResult::Failed
        })
    }

    fn switch_locked(&self, target: GpuMode) -> GpuSwitchResult {
        let state = match self.read_state_or_fail() {
            Ok(state) => state,
            Err(result) => return result,
        };
        let desired = target.hardware_target(self.power.is_on_ac_power());
        let effective_mux = self.effective_mux(state.mux_mode);
        info!(
            "Switching to {}: eco {} -> {}, mux {} -> {}",
            target, state.eco_enabled, desired.eco_enabled, effective_mux, desired.mux_mode
        );

        if desired.eco_enabled && self.mux_zero_guard_tripped() {
            warn!("Eco blocked: MUX was set to the dGPU during this boot");
            return GpuSwitchResult::EcoBlocked;
        }

        if desired.mux_mode != effective_mux {
            if let Err(result) = self.change_mux(state, desired.mux_mode) {
                return result;
            }
            if !desired.eco_enabled {
                self.cleanup_artifacts();
            }
            return self.eco_after_reboot(target, desired);
        }

        // the panel keeps the wiring it booted with, whatever the readback says
        if self.mux_written_this_boot() {
            if desired.eco_enabled {
                return self.eco_after_reboot(target, desired);
            }
            if state.eco_enabled == desired.eco_enabled {
                self.cleanup_artifacts();
                self.persist_mode(target);
                return GpuSwitchResult::RebootRequired;
            }
        }

        if state.eco_enabled == desired.eco_enabled {
            self.cleanup_artifacts();
            self.persist_mode(target);
            return GpuSwitchResult::AlreadySet;
        }

        let result = if desired.eco_enabled {
            self.disable_dgpu(state)
        } else {
            self.enable_dgpu()
        };
        if result.persists_mode() {
            self.persist_mode(target);
        }
        result
    }

    /// Outcome once the MUX is latched and only a reboot can finish the job
    fn eco_after_reboot(&self, target: GpuMode, desired: HardwareState) -> GpuSwitchResult {
        self.persist_mode(target);
        if desired.eco_enabled && self.detector.is_driver_active() {
            info!("MUX latched, Eco waits for the dGPU driver");
            GpuSwitchResult::DriverBlocking
        } else {
            GpuSwitchResult::RebootRequired
        }
    }

    fn schedule_locked(&self, target: GpuMode) -> GpuSwitchResult {
        if self.targets_eco(target) && self.mux_zero_guard_tripped() {
            warn!("Eco blocked: MUX was set to the dGPU during this boot");
            return GpuSwitchResult::EcoBlocked;
        }
        let state = match self.read_state_or_fail() {
            Ok(state) => state,
            Err(result) => return result,
        };
        let desired = target.hardware_target(self.power.is_on_ac_power());
        let effective_mux = self.effective_mux(state.mux_mode);

        if desired.mux_mode == effective_mux
            && state.mux_mode == effective_mux
            && !self.mux_written_this_boot()
            && state.eco_enabled == desired.eco_enabled
        {
            self.cleanup_artifacts();
            self.persist_mode(target);
            return GpuSwitchResult::AlreadySet;
        }

        if desired.mux_mode != effective_mux {
            if let Err(result) = self.change_mux(state, desired.mux_mode) {
                return result;
            }
        }

        if target == GpuMode::Eco {
            let address = self.detector.discrete_pci_address();
            if let Err(e) = self.artifacts.write_driver_block(target, address.as_deref()) {
                if !self.mux_written_this_boot() {
                    error!("Boot artifacts not written, nothing scheduled: {}", e);
                    return GpuSwitchResult::Failed;
                }
                warn!("Boot artifacts not written, startup will retry Eco: {}", e);
            }
        } else {
            self.cleanup_artifacts();
        }
        self.persist_mode(target);
        GpuSwitchResult::RebootRequired
    }

    fn release_locked(&self) -> GpuSwitchResult {
        let state = match self.read_state_or_fail() {
            Ok(state) => state,
            Err(result) => return result,
        };
        if state.eco_enabled {
            self.cleanup_artifacts();
            self.persist_mode(GpuMode::Eco);
            return GpuSwitchResult::AlreadySet;
        }
        if state.mux_mode != MUX_HYBRID
            || self.effective_mux(state.mux_mode) != MUX_HYBRID
            || self.mux_written_this_boot()
        {
            warn!("Driver release refused: MUX is not settled on hybrid");
            return GpuSwitchResult::EcoBlocked;
        }
        if let Err(e) = self.release.release() {
            warn!("Driver release failed: {}", e);
            return GpuSwitchResult::DriverBlocking;
        }

        let result = self.disable_dgpu(state);
        if result.persists_mode() {
            self.persist_mode(GpuMode::Eco);
        }
        result
    }

    fn auto_switch_locked(&self) -> GpuSwitchResult {
        if !self.settings.auto_settle.is_zero() {
            thread::sleep(self.settings.auto_settle);
        }
        if !self.is_auto_enabled() {
            debug!("Auto mode turned off while settling");
            return GpuSwitchResult::AlreadySet;
        }

        let on_ac = self.power.is_on_ac_power();
        let desired = GpuMode::Optimized.hardware_target(on_ac);
        let state = match self.read_state_or_fail() {
            Ok(state) => state,
            Err(result) => return result,
        };
        if state.mux_mode != MUX_HYBRID
            || self.effective_mux(state.mux_mode) != MUX_HYBRID
            || self.mux_written_this_boot()
        {
            info!("MUX not settled on hybrid, auto switch skipped");
            return GpuSwitchResult::AlreadySet;
        }
        if state.eco_enabled == desired.eco_enabled {
            debug!("Auto switch: hardware already matches (AC: {})", on_ac);
            return GpuSwitchResult::AlreadySet;
        }

        info!("Power source changed (AC: {}), adjusting dGPU", on_ac);
        if desired.eco_enabled {
            self.disable_dgpu(state)
        } else {
            self.enable_dgpu()
        }
    }

    /// Turn the dGPU off after every safety check passes
    fn disable_dgpu(&self, state: HardwareState) -> GpuSwitchResult {
        if !self.hardware.supports_eco() {
            error!("{} not supported on this machine", DGPU_DISABLE);
            return GpuSwitchResult::Failed;
        }
        if state.mux_mode == MUX_DISCRETE
            || self.effective_mux(state.mux_mode) == MUX_DISCRETE
            || self.mux_written_this_boot()
            || self.mux_zero_guard_tripped()
        {
            warn!("Eco blocked: MUX routed to the dGPU or written this boot");
            return GpuSwitchResult::EcoBlocked;
        }
        if self.detector.is_driver_active() {
            warn!("dGPU driver is active, Eco not applied");
            return GpuSwitchResult::DriverBlocking;
        }

        match self.write_eco_verified(true) {
            Ok(()) => {
                info!("dGPU disabled");
                self.cleanup_artifacts();
                GpuSwitchResult::Applied
            }
            Err(GpuControlError::DriverBound) => {
                warn!("dGPU driver bound before the write, Eco not applied");
                GpuSwitchResult::DriverBlocking
            }
            Err(e) => {
                error!("Failed to disable dGPU: {}", e);
                GpuSwitchResult::Failed
            }
        }
    }

    fn enable_dgpu(&self) -> GpuSwitchResult {
        match self.write_eco_verified(false) {
            Ok(()) => {
                info!("dGPU enabled");
                self.cleanup_artifacts();
                GpuSwitchResult::Applied
            }
            Err(e) => {
                error!("Failed to enable dGPU: {}", e);
                GpuSwitchResult::Failed
            }
        }
    }

    /// Write the MUX, leaving Eco first. Latches the written value.
    fn change_mux(&self, state: HardwareState, mux: u8) -> std::result::Result<(), GpuSwitchResult> {
        if !self.hardware.supports_mux() {
            error!("MUX switching not supported on this machine");
            return Err(GpuSwitchResult::Failed);
        }
        if state.eco_enabled {
            info!("Leaving Eco before the MUX change");
            self.write_eco_verified(false).map_err(|e| {
                error!("Failed to enable dGPU before the MUX change: {}", e);
                GpuSwitchResult::Failed
            })?;
        }
        // latched before the write so concurrent requests see it in flight
        let previous = self.latch_mux(mux);
        if let Err(e) = self.hardware.set_mux_mode(mux) {
            error!("Failed to set MUX to {}: {}", mux, e);
            *lock(&self.mux_latch) = previous;
            return Err(GpuSwitchResult::Failed);
        }
        self.persist_mux_markers(mux);
        info!("MUX set to {}, effective after reboot", mux);
        Ok(())
    }

    fn write_eco_verified(&self, enabled: bool) -> Result<()> {
        self.hardware.set_eco_flag(enabled)?;
        if !self.settings.settle_delay.is_zero() {
            thread::sleep(self.settings.settle_delay);
        }
        let actual = self.hardware.get_eco_flag()?;
        if actual != enabled {
            return Err(GpuControlError::ReadbackMismatch {
                attribute: DGPU_DISABLE,
                expected: u8::from(enabled).to_string(),
                actual: u8::from(actual).to_string(),
            });
        }
        Ok(())
    }

    fn effective_mux(&self, hardware_mux: u8) -> u8 {
        lock(&self.mux_latch).written.unwrap_or(hardware_mux)
    }

    /// Record a MUX write in memory, returning the previous latch
    fn latch_mux(&self, mux: u8) -> MuxLatch {
        let mut latch = lock(&self.mux_latch);
        let previous = *latch;
        latch.written = Some(mux);
        latch.discrete |= mux == MUX_DISCRETE;
        previous
    }

    fn persist_mux_markers(&self, mux: u8) {
        let Some(boot_id) = self.boot_id.boot_id() else {
            warn!("Boot id unavailable, MUX latch kept in memory only");
            return;
        };
        let mut keys = vec![KEY_MUX_WRITTEN_BOOT_ID];
        if mux == MUX_DISCRETE {
            keys.push(KEY_MUX_ZERO_BOOT_ID);
        }
        for key in keys {
            if let Err(e) = self.store.set_string(key, &boot_id) {
                error!("Failed to persist MUX latch marker {}: {}", key, e);
            }
        }
    }

    /// Marker `key` was set during this boot. An unreadable boot id counts
    /// as this boot.
    fn marker_from_this_boot(&self, key: &str) -> bool {
        let Some(marker) = self.store.get_string(key) else {
            return false;
        };
        match self.boot_id.boot_id() {
            Some(current) => marker == current,
            None => true,
        }
    }

    /// MUX went to the dGPU during this boot, in this process or a previous one
    fn mux_zero_guard_tripped(&self) -> bool {
        lock(&self.mux_latch).discrete || self.marker_from_this_boot(KEY_MUX_ZERO_BOOT_ID)
    }

    /// Any MUX write during this boot, in this process or a previous one
    fn mux_written_this_boot(&self) -> bool {
        lock(&self.mux_latch).written.is_some()
            || self.marker_from_this_boot(KEY_MUX_WRITTEN_BOOT_ID)
    }

    fn clear_stale_mux_markers(&self) {
        let current = self.boot_id.boot_id();
        for key in [KEY_MUX_ZERO_BOOT_ID, KEY_MUX_WRITTEN_BOOT_ID] {
            let Some(marker) = self.store.get_string(key) else {
                continue;
            };
            match current.as_deref() {
                Some(current) if current != marker => {
                    info!("Clearing {} from a previous boot", key);
                    if let Err(e) = self.store.remove(key) {
                        warn!("Failed to clear {}: {}", key, e);
                    }
                }
                Some(_) => info!("{} set earlier in this boot", key),
                None => warn!("Boot id unavailable, keeping {}", key),
            }
        }
    }

    fn recover_boot_safety(&self) {
        let state = match self.hardware.read_state() {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to read GPU state for boot safety check: {}", e);
                return;
            }
        };
        if !state.is_impossible() {
            return;
        }
        error!("dGPU disabled while the MUX routes the panel to it, re-enabling dGPU");
        if let Err(e) = self.write_eco_verified(false) {
            error!("Boot safety recovery failed: {}", e);
        }
        self.cleanup_artifacts();
    }

    fn cleanup_artifacts(&self) {
        if let Err(e) = self.artifacts.remove_driver_block() {
            warn!("Failed to remove boot artifacts: {}", e);
        }
    }

    fn persist_mode(&self, mode: GpuMode) {
        let saved = self
            .store
            .set_string(KEY_GPU_MODE, mode.as_str())
            .and_then(|()| self.store.set_bool(KEY_GPU_AUTO, mode == GpuMode::Optimized));
        if let Err(e) = saved {
            error!("Failed to persist GPU mode {}: {}", mode, e);
        }
    }
}
