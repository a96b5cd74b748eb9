// src/simulator/mod.rs - Deterministic printer that needs no network or hardware
pub mod clock;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SimulatorConfig;
use crate::device::{remote_file_name, ConnectionPhase, DeviceFacade, PrintPhase, PrinterState};
use crate::error::DeviceError;
use crate::simulator::clock::VirtualClock;

pub const NOZZLE_TARGET: f64 = 220.0;
pub const BED_TARGET: f64 = 60.0;
pub const AMBIENT_TEMP: f64 = 25.0;
pub const TOTAL_LAYERS: u32 = 100;

/// How the simulated print advances.
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// Percentage points per tick, 1..=100.
    pub progress_per_tick: u8,
    /// Real time per tick when the ticker runs. `None` means ticks only happen
    /// through `advance`.
    pub tick_period: Option<Duration>,
}

impl SimulatorSettings {
    /// Ticks only through `advance`.
    pub fn manual(progress_per_tick: u8) -> Self {
        Self {
            progress_per_tick: progress_per_tick.clamp(1, 100),
            tick_period: None,
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            progress_per_tick: config.progress_per_tick.clamp(1, 100),
            tick_period: Some(config.tick_period()),
        }
    }
}

#[derive(Debug)]
struct SimState {
    printer: PrinterState,
    clock: VirtualClock,
    /// The clock drives a job only while armed.
    armed: bool,
    files: BTreeSet<String>,
    /// Outstanding `connect` calls not yet matched by a `disconnect`.
    leases: usize,
}

impl SimState {
    fn new() -> Self {
        Self {
            printer: PrinterState {
                nozzle_temp: AMBIENT_TEMP,
                bed_temp: AMBIENT_TEMP,
                chamber_temp: Some(AMBIENT_TEMP),
                ..PrinterState::default()
            },
            clock: VirtualClock::new(),
            armed: false,
            files: BTreeSet::new(),
            leases: 0,
        }
    }

    fn require_connected(&self) -> Result<(), DeviceError> {
        if self.printer.connection_phase != ConnectionPhase::Connected {
            return Err(DeviceError::NotConnected);
        }
        Ok(())
    }

    fn tick(&mut self, ticks: u64, per_tick: u8) {
        if !self.armed {
            return;
        }
        let effective = self.clock.advance(ticks);
        if effective == 0 {
            return;
        }
        let gained = effective.saturating_mul(per_tick as u64).min(100) as u8;
        let printer = &mut self.printer;
        printer.progress_percent = printer.progress_percent.saturating_add(gained).min(100);
        printer.layer_current = printer.progress_percent as u32 * TOTAL_LAYERS / 100;
        printer.remaining_minutes = (100 - printer.progress_percent as u32).div_ceil(2);
        if printer.progress_percent == 100 {
            printer.print_phase = PrintPhase::Completed;
            printer.nozzle_target = 0.0;
            printer.bed_target = 0.0;
            self.armed = false;
            tracing::info!("Simulated print finished after {} ticks", self.clock.elapsed());
        }
    }
}

/// A printer simulated entirely in memory.
///
/// Progress only moves when the virtual clock ticks: through `advance`, or through
/// the ticker task when a tick period is configured. Reads never move the clock, so
/// two `get_status` calls with no tick in between return identical snapshots.
///
/// Connections are leased: every `connect` must be matched by a `disconnect`, and
/// the link only goes down when the last lease is returned.
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    settings: SimulatorSettings,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SimulatedDevice {
    pub fn new(settings: SimulatorSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
            settings,
            ticker: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(SimulatorSettings::from_config(config))
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    /// Offer `ticks` to the virtual clock and return the resulting state.
    pub fn advance(&self, ticks: u64) -> PrinterState {
        let mut state = lock(&self.state);
        state.tick(ticks, self.settings.progress_per_tick);
        state.printer.clone()
    }

    /// Ticks it takes a fresh print to finish.
    pub fn ticks_to_complete(&self) -> u64 {
        100u64.div_ceil(self.settings.progress_per_tick as u64)
    }

    /// Names of files "uploaded" so far.
    pub fn files(&self) -> Vec<String> {
        lock(&self.state).files.iter().cloned().collect()
    }

    pub fn is_ticker_running(&self) -> bool {
        lock(&self.ticker).is_some()
    }

    fn start_ticker(&self) {
        let Some(period) = self.settings.tick_period else {
            return;
        };
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() {
            return;
        }
        let state = self.state.clone();
        let per_tick = self.settings.progress_per_tick;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => lock(&state).tick(1, per_tick),
                }
            }
            tracing::debug!("Simulator ticker stopped");
        }));
    }

    fn stop_ticker(&self) {
        if let Some(handle) = lock(&self.ticker).take() {
            let _ = self.shutdown_tx.send(());
            handle.abort();
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DeviceFacade for SimulatedDevice {
    async fn connect(&self) -> Result<(), DeviceError> {
        let leases = {
            let mut state = lock(&self.state);
            state.leases += 1;
            state.printer.connection_phase = ConnectionPhase::Connected;
            state.leases
        };
        self.start_ticker();
        if leases == 1 {
            tracing::info!("Simulated device connected");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        {
            let mut state = lock(&self.state);
            if state.leases == 0 {
                return;
            }
            state.leases -= 1;
            if state.leases > 0 {
                tracing::debug!("Simulated device still leased {} time(s)", state.leases);
                return;
            }
            state.printer.connection_phase = ConnectionPhase::Disconnected;
        }
        self.stop_ticker();
        tracing::info!("Simulated device disconnected");
    }

    async fn upload_file(&self, path: &Path, size_hint: Option<u64>) -> Result<String, DeviceError> {
        let name = remote_file_name(path)?;
        let mut state = lock(&self.state);
        state.require_connected()?;
        state.files.insert(name.clone());
        tracing::info!("Simulated upload of {} ({} bytes)", name, size_hint.unwrap_or(0));
        Ok(name)
    }

    async fn start_print(&self, filename: &str) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.require_connected()?;
        if state.printer.print_phase.is_active() {
            return Err(DeviceError::Busy(format!(
                "already printing {}",
                state.printer.current_file.clone().unwrap_or_default()
            )));
        }
        if !state.files.contains(filename) {
            return Err(DeviceError::Rejected(format!("file not found: {}", filename)));
        }

        state.clock.reset();
        state.armed = true;
        let printer = &mut state.printer;
        printer.print_phase = PrintPhase::Printing;
        printer.progress_percent = 0;
        printer.current_file = Some(filename.to_string());
        printer.nozzle_target = NOZZLE_TARGET;
        printer.bed_target = BED_TARGET;
        printer.nozzle_temp = NOZZLE_TARGET;
        printer.bed_temp = BED_TARGET;
        printer.layer_current = 0;
        printer.layer_total = TOTAL_LAYERS;
        printer.remaining_minutes = 50;
        printer.last_error = None;
        tracing::info!("Simulated print started: {}", filename);
        Ok(())
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.require_connected()?;
        if state.printer.print_phase != PrintPhase::Printing {
            return Err(DeviceError::InvalidState(format!(
                "cannot pause while {:?}",
                state.printer.print_phase
            )));
        }
        state.clock.freeze();
        state.printer.print_phase = PrintPhase::Paused;
        tracing::info!("Simulated print paused at {}%", state.printer.progress_percent);
        Ok(())
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.require_connected()?;
        if state.printer.print_phase != PrintPhase::Paused {
            return Err(DeviceError::InvalidState(format!(
                "cannot resume while {:?}",
                state.printer.print_phase
            )));
        }
        state.clock.unfreeze();
        state.printer.print_phase = PrintPhase::Printing;
        tracing::info!("Simulated print resumed");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.require_connected()?;
        if !state.printer.print_phase.is_active() {
            return Ok(());
        }
        state.armed = false;
        state.clock.freeze();
        let printer = &mut state.printer;
        printer.print_phase = PrintPhase::Cancelled;
        printer.nozzle_target = 0.0;
        printer.bed_target = 0.0;
        tracing::info!("Simulated print cancelled at {}%", printer.progress_percent);
        Ok(())
    }

    async fn get_status(&self) -> PrinterState {
        lock(&self.state).printer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn printing_device(per_tick: u8) -> SimulatedDevice {
        let device = SimulatedDevice::new(SimulatorSettings::manual(per_tick));
        device.connect().await.unwrap();
        device.upload_file(&PathBuf::from("/tmp/cube.stl"), Some(84)).await.unwrap();
        device.start_print("cube.stl").await.unwrap();
        device
    }

    #[tokio::test]
    async fn test_start_sets_targets_and_layers() {
        let device = printing_device(1).await;
        let state = device.get_status().await;
        assert_eq!(state.print_phase, PrintPhase::Printing);
        assert_eq!(state.progress_percent, 0);
        assert_eq!(state.nozzle_target, NOZZLE_TARGET);
        assert_eq!(state.bed_temp, BED_TARGET);
        assert_eq!(state.layer_total, TOTAL_LAYERS);

        let state = device.advance(30);
        assert_eq!(state.progress_percent, 30);
        assert_eq!(state.layer_current, 30);
        assert_eq!(state.remaining_minutes, 35);
    }

    #[tokio::test]
    async fn test_completion_disarms_clock() {
        let device = printing_device(7).await;
        assert_eq!(device.ticks_to_complete(), 15);
        let state = device.advance(15);
        assert_eq!(state.progress_percent, 100);
        assert_eq!(state.print_phase, PrintPhase::Completed);
        assert_eq!(device.advance(5), state);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let device = SimulatedDevice::new(SimulatorSettings::manual(1));
        let err = device.upload_file(Path::new("/tmp/a.stl"), None).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
        assert!(matches!(device.start_print("a.stl").await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn test_unknown_file_is_rejected() {
        let device = SimulatedDevice::new(SimulatorSettings::manual(1));
        device.connect().await.unwrap();
        assert!(matches!(device.start_print("ghost.stl").await, Err(DeviceError::Rejected(_))));
        assert_eq!(device.get_status().await.print_phase, PrintPhase::Idle);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_halts() {
        let device = printing_device(2).await;
        device.advance(10);
        device.stop().await.unwrap();
        let state = device.advance(10);
        assert_eq!(state.print_phase, PrintPhase::Cancelled);
        assert_eq!(state.progress_percent, 20);
        // A new job may start after a cancel.
        device.start_print("cube.stl").await.unwrap();
        assert_eq!(device.get_status().await.progress_percent, 0);
    }

    #[tokio::test]
    async fn test_pause_requires_printing() {
        let device = SimulatedDevice::new(SimulatorSettings::manual(1));
        device.connect().await.unwrap();
        assert!(matches!(device.pause().await, Err(DeviceError::InvalidState(_))));
        assert!(matches!(device.resume().await, Err(DeviceError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_advances_in_real_time_and_stops_on_disconnect() {
        let device = SimulatedDevice::new(SimulatorSettings {
            progress_per_tick: 10,
            tick_period: Some(Duration::from_millis(100)),
        });
        device.connect().await.unwrap();
        assert!(device.is_ticker_running());
        device.upload_file(Path::new("/tmp/cube.stl"), None).await.unwrap();
        device.start_print("cube.stl").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let state = device.get_status().await;
        assert_eq!(state.print_phase, PrintPhase::Completed);

        device.disconnect().await;
        assert!(!device.is_ticker_running());
        assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_stays_up_until_last_lease_returns() {
        let device = SimulatedDevice::new(SimulatorSettings {
            progress_per_tick: 10,
            tick_period: Some(Duration::from_millis(100)),
        });
        device.connect().await.unwrap();
        device.connect().await.unwrap();

        device.disconnect().await;
        assert!(device.is_ticker_running());
        assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Connected);

        device.disconnect().await;
        assert!(!device.is_ticker_running());
        assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Disconnected);

        // Unmatched disconnects do not underflow into a later session.
        device.disconnect().await;
        device.connect().await.unwrap();
        assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Connected);
    }
}
