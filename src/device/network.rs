// src/device/network.rs - DeviceFacade backed by a live control session and FTPS transfer
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::communication::commands::{CalibrationOptions, Command, Fan, PrinterCommand, Reply};
use crate::communication::protocol::{CommandProtocol, ProtocolStats};
use crate::communication::status_monitor::StatusMonitor;
use crate::communication::transport::{
    ControlChannel, DeviceIdentity, DeviceSession, LinkStats, SessionSettings, TelemetrySink,
    TransportSession,
};
use crate::config::Config;
use crate::device::{ConnectionPhase, DeviceFacade, PrinterState, AMS_MAX_SLOTS};
use crate::error::DeviceError;
use crate::file_transfer::{FileTransfer, TransferReport};

/// Routes every payload the session receives, in receipt order: replies to the
/// command protocol, status to the monitor.
pub struct TelemetryDispatcher {
    protocol: Arc<CommandProtocol>,
    monitor: Arc<StatusMonitor>,
}

impl TelemetryDispatcher {
    pub fn new(protocol: Arc<CommandProtocol>, monitor: Arc<StatusMonitor>) -> Self {
        Self { protocol, monitor }
    }
}

#[async_trait]
impl TelemetrySink for TelemetryDispatcher {
    async fn on_telemetry(&self, topic: &str, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Dropping unparseable payload on {}: {}", topic, e);
                return;
            }
        };
        self.protocol.dispatch_reply(&value).await;
        self.monitor.apply(&value).await;
    }

    async fn on_phase_change(&self, phase: ConnectionPhase) {
        self.monitor.set_connection_phase(phase).await;
        if phase == ConnectionPhase::Disconnected {
            // Clean sessions lose in-flight replies with the link.
            self.protocol.fail_all().await;
        }
    }
}

/// Nozzle target sent with a filament change.
pub const FILAMENT_CHANGE_TEMP: u32 = 220;

/// Options for print start commands.
#[derive(Debug, Clone)]
pub struct PrintOptions {
    pub plate_index: u32,
    pub use_ams: bool,
    pub bed_leveling: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            plate_index: 1,
            use_ams: false,
            bed_leveling: true,
        }
    }
}

/// A real printer: control session, command protocol, telemetry and transfer.
pub struct NetworkDevice {
    session: Arc<dyn DeviceSession>,
    protocol: Arc<CommandProtocol>,
    monitor: Arc<StatusMonitor>,
    transfer: FileTransfer,
    print_options: PrintOptions,
    sweep_interval: Duration,
    // Serializes start/stop decisions against one device.
    op_lock: Mutex<()>,
    // Callers holding the session open; it closes when the count drops to zero.
    leases: Mutex<usize>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkDevice {
    pub fn new(config: &Config) -> Self {
        let identity = DeviceIdentity::from_config(config);
        let session = Arc::new(TransportSession::new(
            identity.clone(),
            SessionSettings::from_config(config),
        ));
        let transfer = FileTransfer::new(&identity, config);
        Self::with_session(session, transfer, config)
    }

    /// Build around any session implementation.
    pub fn with_session<S>(session: Arc<S>, transfer: FileTransfer, config: &Config) -> Self
    where
        S: DeviceSession + 'static,
    {
        let channel: Arc<dyn ControlChannel> = session.clone();
        let protocol = Arc::new(CommandProtocol::new(channel, config.session.command_timeout()));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            session,
            protocol,
            monitor: Arc::new(StatusMonitor::new()),
            transfer,
            print_options: PrintOptions::default(),
            sweep_interval: config.session.sweep_interval(),
            op_lock: Mutex::new(()),
            leases: Mutex::new(0),
            sweeper: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn with_print_options(mut self, options: PrintOptions) -> Self {
        self.print_options = options;
        self
    }

    pub fn monitor(&self) -> Arc<StatusMonitor> {
        self.monitor.clone()
    }

    pub async fn protocol_stats(&self) -> ProtocolStats {
        self.protocol.get_stats().await
    }

    /// Connection-level counters: connects, drops and automatic reconnects.
    pub fn link_stats(&self) -> LinkStats {
        self.session.link_stats()
    }

    /// Send a command and require an affirmative reply.
    pub async fn execute(&self, command: PrinterCommand) -> Result<Reply, DeviceError> {
        if !command.expects_reply() {
            self.protocol.publish(command.into()).await?;
            return Ok(Reply {
                correlation_id: "0".to_string(),
                domain: String::new(),
                body: Value::Null,
            });
        }
        let command: Command = command.into();
        let reply = self.protocol.send(command, None).await?;
        if !reply.is_success() {
            let reason = reply.failure_reason();
            tracing::warn!("Device rejected {}: {}", reply.action(), reason);
            return Err(DeviceError::Rejected(reason));
        }
        Ok(reply)
    }

    pub async fn set_fan_speed(&self, fan: Fan, percent: u8) -> Result<(), DeviceError> {
        if percent > 100 {
            return Err(DeviceError::InvalidState(format!(
                "fan speed {}% is outside 0..=100",
                percent
            )));
        }
        self.execute(PrinterCommand::SetFan { fan, percent }).await.map(|_| ())
    }

    /// Switch the extruder to a global AMS slot (`unit * 4 + tray`).
    pub async fn change_filament(&self, target_slot: u32) -> Result<(), DeviceError> {
        if target_slot >= AMS_MAX_SLOTS {
            return Err(DeviceError::InvalidState(format!(
                "AMS slot {} does not exist",
                target_slot
            )));
        }
        let current_temp = self.monitor.snapshot().await.nozzle_temp.max(0.0) as u32;
        self.execute(PrinterCommand::AmsChangeFilament {
            target_slot,
            current_temp,
            target_temp: FILAMENT_CHANGE_TEMP,
        })
        .await
        .map(|_| ())
    }

    pub async fn calibrate(&self, options: CalibrationOptions) -> Result<(), DeviceError> {
        if options.is_empty() {
            return Err(DeviceError::InvalidState("no calibration routine selected".to_string()));
        }
        self.execute(PrinterCommand::Calibrate(options)).await.map(|_| ())
    }

    pub async fn upload(&self, path: &Path, remote_name: Option<&str>) -> Result<TransferReport, DeviceError> {
        self.transfer.upload(path, remote_name).await
    }

    pub async fn list_files(&self) -> Result<Vec<String>, DeviceError> {
        self.transfer.list_files().await
    }

    pub async fn delete_file(&self, remote_name: &str) -> Result<(), DeviceError> {
        self.transfer.delete(remote_name).await
    }

    async fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let protocol = self.protocol.clone();
        let period = self.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        let expired = protocol.sweep_expired().await;
                        if expired > 0 {
                            tracing::debug!("Swept {} expired command(s)", expired);
                        }
                    }
                }
            }
        }));
    }

    async fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = self.shutdown_tx.send(());
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl DeviceFacade for NetworkDevice {
    async fn connect(&self) -> Result<(), DeviceError> {
        let mut leases = self.leases.lock().await;
        if *leases > 0 && self.session.is_connected() {
            *leases += 1;
            return Ok(());
        }
        let sink = Arc::new(TelemetryDispatcher::new(self.protocol.clone(), self.monitor.clone()));
        self.session.open(sink).await?;
        self.start_sweeper().await;
        if let Err(e) = self.execute(PrinterCommand::PushAll).await {
            tracing::warn!("Initial status request failed: {}", e);
        }
        *leases += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut leases = self.leases.lock().await;
        if *leases == 0 {
            return;
        }
        *leases -= 1;
        if *leases > 0 {
            tracing::debug!("Session still held by {} caller(s)", *leases);
            return;
        }
        self.stop_sweeper().await;
        self.session.close().await;
        self.protocol.fail_all().await;
        self.monitor.set_connection_phase(ConnectionPhase::Disconnected).await;
    }

    async fn upload_file(&self, path: &Path, size_hint: Option<u64>) -> Result<String, DeviceError> {
        let report = self.transfer.upload(path, None).await?;
        if let Some(hint) = size_hint {
            if hint != report.bytes_transferred {
                tracing::warn!(
                    "Uploaded {} bytes, caller expected {}",
                    report.bytes_transferred,
                    hint
                );
            }
        }
        Ok(report.remote_name().to_string())
    }

    async fn start_print(&self, filename: &str) -> Result<(), DeviceError> {
        let _guard = self.op_lock.lock().await;
        let status = self.monitor.snapshot().await;
        if status.print_phase.is_active() {
            return Err(DeviceError::Busy(format!(
                "{:?} {}",
                status.print_phase,
                status.current_file.unwrap_or_default()
            )));
        }
        let options = &self.print_options;
        self.execute(PrinterCommand::ProjectFile {
            remote_path: self.transfer.remote_path(filename),
            plate_index: options.plate_index,
            use_ams: options.use_ams,
            bed_leveling: options.bed_leveling,
        })
        .await?;
        self.monitor.begin_job(filename).await;
        Ok(())
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        self.execute(PrinterCommand::Pause).await.map(|_| ())
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.execute(PrinterCommand::Resume).await.map(|_| ())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let _guard = self.op_lock.lock().await;
        self.execute(PrinterCommand::Stop).await?;
        self.monitor.mark_cancelled().await;
        Ok(())
    }

    async fn get_status(&self) -> PrinterState {
        self.monitor.snapshot().await
    }
}
