// src/communication/status_monitor.rs - Telemetry consumer, single writer of PrinterState
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::device::{AmsSlot, ConnectionPhase, PrintPhase, PrinterState, AMS_MAX_SLOTS};

/// Field updates parsed from one telemetry payload. Every field is optional:
/// anything missing or malformed leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub print_phase: Option<PrintPhase>,
    pub progress_percent: Option<u8>,
    pub nozzle_temp: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub bed_temp: Option<f64>,
    pub bed_target: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub current_file: Option<String>,
    pub layer_current: Option<u32>,
    pub layer_total: Option<u32>,
    pub remaining_minutes: Option<u32>,
    /// `Some(None)` clears a previous error.
    pub last_error: Option<Option<String>>,
    /// Replaces the whole tray list when present.
    pub ams_slots: Option<Vec<AmsSlot>>,
    /// `Some(None)`: no tray is feeding.
    pub ams_current_slot: Option<Option<u32>>,
    pub ams_humidity: Option<f64>,
}

impl TelemetryUpdate {
    /// Parse the `print` object of a report payload. Returns `None` when the payload
    /// carries no status at all.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let print = payload.get("print")?.as_object()?;
        let mut update = TelemetryUpdate::default();

        update.print_phase = print
            .get("gcode_state")
            .and_then(Value::as_str)
            .and_then(PrintPhase::from_device_state);
        update.progress_percent = print
            .get("mc_percent")
            .and_then(number)
            .filter(|p| *p >= 0.0)
            .map(|p| p.min(100.0) as u8);

        update.nozzle_temp = print.get("nozzle_temper").and_then(number);
        update.nozzle_target = print.get("nozzle_target_temper").and_then(number);
        update.bed_temp = print.get("bed_temper").and_then(number);
        update.bed_target = print.get("bed_target_temper").and_then(number);
        update.chamber_temp = print.get("chamber_temper").and_then(number);

        update.layer_current = print.get("layer_num").and_then(count);
        update.layer_total = print.get("total_layer_num").and_then(count);
        update.remaining_minutes = print.get("mc_remaining_time").and_then(count);

        update.current_file = print
            .get("gcode_file")
            .or_else(|| print.get("subtask_name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let reason = print
            .get("fail_reason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty() && *r != "0");
        match (print.get("print_error").and_then(count), reason) {
            (_, Some(reason)) => update.last_error = Some(Some(reason.to_string())),
            (Some(0), None) => update.last_error = Some(None),
            (Some(code), None) => update.last_error = Some(Some(format!("device error code {}", code))),
            (None, None) => {}
        }

        if let Some(ams) = print.get("ams").and_then(Value::as_object) {
            update.ams_slots = ams.get("ams").and_then(Value::as_array).map(|units| ams_slots(units));
            update.ams_current_slot = ams
                .get("tray_now")
                .and_then(count)
                .map(|slot| (slot < AMS_MAX_SLOTS).then_some(slot));
            update.ams_humidity = ams.get("ams_humidity").and_then(number);
        }

        Some(update)
    }

    pub fn is_empty(&self) -> bool {
        *self == TelemetryUpdate::default()
    }

    /// Apply every present field to `state` in one step.
    ///
    /// Progress never goes backwards while a job stays active. Once a stop was
    /// issued, the phase stays `Cancelled` whatever the device reports next.
    pub fn apply_to(&self, state: &mut PrinterState, stop_requested: bool) {
        let was_active = state.print_phase.is_active();

        if let Some(phase) = self.print_phase {
            state.print_phase = if stop_requested { PrintPhase::Cancelled } else { phase };
        }
        if let Some(progress) = self.progress_percent {
            state.progress_percent = if was_active && state.print_phase.is_active() {
                state.progress_percent.max(progress)
            } else {
                progress
            };
        }
        if state.print_phase == PrintPhase::Completed {
            state.progress_percent = 100;
        }

        if let Some(t) = self.nozzle_temp {
            state.nozzle_temp = t;
        }
        if let Some(t) = self.nozzle_target {
            state.nozzle_target = t;
        }
        if let Some(t) = self.bed_temp {
            state.bed_temp = t;
        }
        if let Some(t) = self.bed_target {
            state.bed_target = t;
        }
        if let Some(t) = self.chamber_temp {
            state.chamber_temp = Some(t);
        }
        if let Some(file) = &self.current_file {
            state.current_file = Some(file.clone());
        }
        if let Some(layer) = self.layer_current {
            state.layer_current = layer;
        }
        if let Some(total) = self.layer_total {
            state.layer_total = total;
        }
        if let Some(minutes) = self.remaining_minutes {
            state.remaining_minutes = minutes;
        }
        if let Some(error) = &self.last_error {
            state.last_error = error.clone();
        }
        if let Some(slots) = &self.ams_slots {
            state.ams.slots = slots.clone();
        }
        if let Some(current) = self.ams_current_slot {
            state.ams.current_slot = current;
        }
        if let Some(humidity) = self.ams_humidity {
            state.ams.humidity = Some(humidity);
        }
    }
}

fn ams_slots(units: &[Value]) -> Vec<AmsSlot> {
    units
        .iter()
        .flat_map(|unit| {
            let unit_id = unit.get("id").and_then(count).unwrap_or(0);
            let trays = unit.get("tray").and_then(Value::as_array);
            trays.into_iter().flatten().map(move |tray| {
                let text = |key: &str| tray.get(key).and_then(Value::as_str).unwrap_or("").to_string();
                let material = text("tray_type");
                AmsSlot {
                    unit: unit_id,
                    slot: tray.get("id").and_then(count).unwrap_or(0),
                    loaded: !material.is_empty(),
                    material,
                    color: text("tray_color"),
                    remaining_percent: tray.get("remain").and_then(number).unwrap_or(0.0),
                }
            })
        })
        .collect()
}

/// Numbers arrive as JSON numbers or numeric strings depending on firmware.
fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn count(value: &Value) -> Option<u32> {
    number(value).filter(|v| *v >= 0.0).map(|v| v.min(u32::MAX as f64) as u32)
}

struct MonitorState {
    printer: PrinterState,
    stop_requested: bool,
}

/// Maintains the latest known PrinterState from device telemetry.
///
/// All mutation goes through this type; readers get copies.
pub struct StatusMonitor {
    state: RwLock<MonitorState>,
    updates: broadcast::Sender<PrinterState>,
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMonitor {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(MonitorState {
                printer: PrinterState::default(),
                stop_requested: false,
            }),
            updates,
        }
    }

    /// Apply one raw telemetry payload. Returns true when it changed anything.
    pub async fn apply(&self, payload: &Value) -> bool {
        let Some(update) = TelemetryUpdate::from_payload(payload) else {
            return false;
        };
        if update.is_empty() {
            return false;
        }
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.printer.print_phase;
            let stop_requested = state.stop_requested;
            update.apply_to(&mut state.printer, stop_requested);
            if before != state.printer.print_phase {
                tracing::info!("Print phase {:?} -> {:?}", before, state.printer.print_phase);
            }
            state.printer.clone()
        };
        tracing::trace!("Telemetry applied: {}% ({:?})", snapshot.progress_percent, snapshot.print_phase);
        let _ = self.updates.send(snapshot);
        true
    }

    pub async fn set_connection_phase(&self, phase: ConnectionPhase) {
        let snapshot = {
            let mut state = self.state.write().await;
            if state.printer.connection_phase == phase {
                return;
            }
            state.printer.connection_phase = phase;
            state.printer.clone()
        };
        let _ = self.updates.send(snapshot);
    }

    /// A start command was accepted: progress restarts from zero.
    pub async fn begin_job(&self, filename: &str) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.stop_requested = false;
            let printer = &mut state.printer;
            printer.print_phase = PrintPhase::Preparing;
            printer.progress_percent = 0;
            printer.layer_current = 0;
            printer.current_file = Some(filename.to_string());
            printer.last_error = None;
            printer.clone()
        };
        tracing::info!("Job started: {}", filename);
        let _ = self.updates.send(snapshot);
    }

    /// A stop command was accepted.
    pub async fn mark_cancelled(&self) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.stop_requested = true;
            state.printer.print_phase = PrintPhase::Cancelled;
            state.printer.clone()
        };
        tracing::info!("Job cancelled");
        let _ = self.updates.send(snapshot);
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> PrinterState {
        self.state.read().await.printer.clone()
    }

    /// Receive a snapshot after every applied update.
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterState> {
        self.updates.subscribe()
    }
}
