//! Test doubles for the controller's collaborators

use crate::driver::{DriverActivityDetector, GpuVendor};
use crate::errors::{GpuControlError, Result};
use crate::hardware::HardwareGateway;
use crate::mode::{HardwareState, MUX_DISCRETE};
use crate::power::PowerSource;
use crate::privileged::{CommandOutput, Elevation, PrivilegedExecutor, SystemExecutor};
use crate::store::{BootIdSource, SettingsStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Gate = Mutex<Option<(Sender<()>, Receiver<()>)>>;

/// Blocks the first caller until released. Returns (entered, release).
fn arm(gate: &Gate) -> (Receiver<()>, Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *gate.lock().unwrap() = Some((entered_tx, release_rx));
    (entered_rx, release_tx)
}

fn pass(gate: &Gate) {
    let armed = gate.lock().unwrap().take();
    if let Some((entered, release)) = armed {
        let _ = entered.send(());
        let _ = release.recv();
    }
}

pub struct ToggleDetector {
    vendor: GpuVendor,
    active: AtomicBool,
    address: Option<String>,
}

impl ToggleDetector {
    pub fn new(vendor: GpuVendor, active: bool) -> Self {
        Self {
            vendor,
            active: AtomicBool::new(active),
            address: None,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl DriverActivityDetector for ToggleDetector {
    fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    fn is_driver_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn discrete_pci_address(&self) -> Option<String> {
        self.address.clone()
    }
}

/// Firmware model: MUX writes land on the next boot, eco writes are live.
/// Records every write and every unsafe combination it was asked for.
pub struct ScriptedGateway {
    live: Mutex<HardwareState>,
    pending_mux: Mutex<Option<u8>>,
    detector: Arc<ToggleDetector>,
    eco_writes: Mutex<Vec<bool>>,
    mux_writes: Mutex<Vec<u8>>,
    violations: AtomicUsize,
    ignore_eco_writes: AtomicBool,
    reject_writes: AtomicBool,
    written_mux_readback: AtomicBool,
    eco_gate: Gate,
    mux_gate: Gate,
}

impl ScriptedGateway {
    pub fn new(state: HardwareState, detector: Arc<ToggleDetector>) -> Self {
        Self {
            live: Mutex::new(state),
            pending_mux: Mutex::new(None),
            detector,
            eco_writes: Mutex::new(Vec::new()),
            mux_writes: Mutex::new(Vec::new()),
            violations: AtomicUsize::new(0),
            ignore_eco_writes: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            written_mux_readback: AtomicBool::new(false),
            eco_gate: Mutex::new(None),
            mux_gate: Mutex::new(None),
        }
    }

    pub fn live(&self) -> HardwareState {
        *self.live.lock().unwrap()
    }

    pub fn pending_mux(&self) -> Option<u8> {
        *self.pending_mux.lock().unwrap()
    }

    pub fn eco_writes(&self) -> Vec<bool> {
        self.eco_writes.lock().unwrap().clone()
    }

    pub fn mux_writes(&self) -> Vec<u8> {
        self.mux_writes.lock().unwrap().clone()
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Accept eco writes without changing anything
    pub fn ignore_eco_writes(&self, ignore: bool) {
        self.ignore_eco_writes.store(ignore, Ordering::SeqCst);
    }

    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// MUX readback returns the value written instead of the booted one
    pub fn report_written_mux(&self, enabled: bool) {
        self.written_mux_readback.store(enabled, Ordering::SeqCst);
    }

    pub fn arm_eco_gate(&self) -> (Receiver<()>, Sender<()>) {
        arm(&self.eco_gate)
    }

    pub fn arm_mux_gate(&self) -> (Receiver<()>, Sender<()>) {
        arm(&self.mux_gate)
    }

    /// Apply the pending MUX value as a reboot would
    pub fn reboot(&self) {
        if let Some(mux) = self.pending_mux.lock().unwrap().take() {
            self.live.lock().unwrap().mux_mode = mux;
        }
    }

    /// Force a state, bypassing every guard
    pub fn tamper(&self, state: HardwareState) {
        *self.live.lock().unwrap() = state;
    }

    fn rejected(&self, attribute: &'static str, value: String) -> GpuControlError {
        GpuControlError::HardwareRejected {
            attribute,
            value,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "firmware refused"),
        }
    }
}

impl HardwareGateway for ScriptedGateway {
    fn supports_eco(&self) -> bool {
        true
    }

    fn supports_mux(&self) -> bool {
        true
    }

    fn get_eco_flag(&self) -> Result<bool> {
        Ok(self.live.lock().unwrap().eco_enabled)
    }

    fn set_eco_flag(&self, enabled: bool) -> Result<()> {
        pass(&self.eco_gate);
        if enabled && self.detector.is_driver_active() {
            self.violations.fetch_add(1, Ordering::SeqCst);
            return Err(GpuControlError::DriverBound);
        }
        if enabled
            && (self.live().mux_mode == MUX_DISCRETE || self.pending_mux() == Some(MUX_DISCRETE))
        {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(self.rejected("dgpu_disable", u8::from(enabled).to_string()));
        }
        self.eco_writes.lock().unwrap().push(enabled);
        if !self.ignore_eco_writes.load(Ordering::SeqCst) {
            self.live.lock().unwrap().eco_enabled = enabled;
        }
        Ok(())
    }

    fn get_mux_mode(&self) -> Result<u8> {
        let live = self.live().mux_mode;
        if self.written_mux_readback.load(Ordering::SeqCst) {
            return Ok(self.pending_mux().unwrap_or(live));
        }
        // readback lags until reboot
        Ok(live)
    }

    fn set_mux_mode(&self, mode: u8) -> Result<()> {
        pass(&self.mux_gate);
        if self.live().eco_enabled {
            self.violations.fetch_add(1, Ordering::SeqCst);
            return Err(GpuControlError::MuxWhileDgpuOff);
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(self.rejected("gpu_mux_mode", mode.to_string()));
        }
        self.mux_writes.lock().unwrap().push(mode);
        *self.pending_mux.lock().unwrap() = Some(mode);
        Ok(())
    }
}

pub struct TogglePower {
    on_ac: AtomicBool,
    gate: Gate,
}

impl TogglePower {
    pub fn new(on_ac: bool) -> Self {
        Self {
            on_ac: AtomicBool::new(on_ac),
            gate: Mutex::new(None),
        }
    }

    pub fn set_on_ac(&self, on_ac: bool) {
        self.on_ac.store(on_ac, Ordering::SeqCst);
    }

    /// Next read blocks until released
    pub fn arm_gate(&self) -> (Receiver<()>, Sender<()>) {
        arm(&self.gate)
    }
}

impl PowerSource for TogglePower {
    fn is_on_ac_power(&self) -> bool {
        pass(&self.gate);
        self.on_ac.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    strings: Mutex<HashMap<String, String>>,
    bools: Mutex<HashMap<String, bool>>,
}

impl SettingsStore for MemoryStore {
    fn get_string(&self, key: &str) -> Option<String> {
        self.strings.lock().unwrap().get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.strings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.bools.lock().unwrap().get(key).copied()
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.bools.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.strings.lock().unwrap().remove(key);
        self.bools.lock().unwrap().remove(key);
        Ok(())
    }
}

pub struct FixedBootId(Mutex<Option<String>>);

impl FixedBootId {
    pub fn new(id: &str) -> Self {
        Self(Mutex::new(Some(id.to_string())))
    }

    pub fn set(&self, id: Option<&str>) {
        *self.0.lock().unwrap() = id.map(str::to_string);
    }
}

impl BootIdSource for FixedBootId {
    fn boot_id(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Counts privileged runs; optionally executes them for real without elevation
pub struct CountingExecutor {
    calls: AtomicUsize,
    code: i32,
    inner: Option<SystemExecutor>,
    hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl CountingExecutor {
    pub fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            code: 0,
            inner: None,
            hook: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            code: 1,
            ..Self::succeeding()
        }
    }

    /// Runs scripts with plain `sh`, for artifact paths inside a temp dir
    pub fn direct() -> Self {
        Self {
            inner: Some(SystemExecutor::new(Elevation::Direct)),
            ..Self::succeeding()
        }
    }

    pub fn on_run(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PrivilegedExecutor for CountingExecutor {
    fn run(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.hook {
            hook();
        }
        match &self.inner {
            Some(inner) => inner.run(script, timeout),
            None => Ok(CommandOutput {
                code: Some(self.code),
                ..CommandOutput::default()
            }),
        }
    }
}
