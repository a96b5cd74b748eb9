// src/device/mod.rs - Device capability surface shared by real and simulated printers
pub mod network;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::DeviceError;

/// Control-channel state. Transitions run Disconnected -> Connecting -> Connected,
/// and back to Disconnected on failure or explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrintPhase {
    #[default]
    Idle,
    Preparing,
    Printing,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl PrintPhase {
    /// Parse a device `gcode_state` string.
    pub fn from_device_state(state: &str) -> Option<Self> {
        match state.trim().to_ascii_uppercase().as_str() {
            "IDLE" | "STANDBY" => Some(Self::Idle),
            "PREPARE" | "PREPARING" | "SLICING" => Some(Self::Preparing),
            "RUNNING" | "PRINTING" => Some(Self::Printing),
            "PAUSE" | "PAUSED" => Some(Self::Paused),
            "FINISH" | "FINISHED" | "COMPLETED" => Some(Self::Completed),
            "FAILED" | "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// A job is in flight: a new start must be refused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Printing | Self::Paused)
    }

    /// Monitoring stops on these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

/// Trays per AMS unit.
pub const AMS_SLOTS_PER_UNIT: u32 = 4;
/// Four units of four trays each. `tray_now` values at or above this mean "none".
pub const AMS_MAX_SLOTS: u32 = 16;

/// One filament tray of an AMS unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AmsSlot {
    pub unit: u32,
    /// 0..=3 within the unit.
    pub slot: u32,
    pub material: String,
    /// Hex RGBA as reported, e.g. `FF0000FF`.
    pub color: String,
    pub remaining_percent: f64,
    pub loaded: bool,
}

impl AmsSlot {
    /// Slot number across all units, as `ams_change_filament` expects it.
    pub fn global_slot(&self) -> u32 {
        self.unit * AMS_SLOTS_PER_UNIT + self.slot
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AmsStatus {
    pub slots: Vec<AmsSlot>,
    /// Global slot currently feeding the extruder.
    pub current_slot: Option<u32>,
    pub humidity: Option<f64>,
}

impl AmsStatus {
    pub fn slot(&self, global_slot: u32) -> Option<&AmsSlot> {
        self.slots.iter().find(|slot| slot.global_slot() == global_slot)
    }
}

/// Last known device state. Always handed out by value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrinterState {
    pub connection_phase: ConnectionPhase,
    pub print_phase: PrintPhase,
    /// 0..=100
    pub progress_percent: u8,
    pub nozzle_temp: f64,
    pub nozzle_target: f64,
    pub bed_temp: f64,
    pub bed_target: f64,
    pub chamber_temp: Option<f64>,
    pub current_file: Option<String>,
    pub layer_current: u32,
    pub layer_total: u32,
    pub remaining_minutes: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub ams: AmsStatus,
}

impl PrinterState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Capabilities every printer implementation provides. The workflow only ever
/// talks to this trait; which implementation sits behind it is decided by the
/// caller at construction time.
#[async_trait]
pub trait DeviceFacade: Send + Sync {
    /// Takes a connection lease. The first lease opens the link; later ones join it.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Returns one lease. The last one closes the link and stops every background
    /// task owned by the device. Without an outstanding lease this does nothing.
    async fn disconnect(&self);

    /// Push a model to device storage. Returns the remote file name.
    async fn upload_file(&self, path: &Path, size_hint: Option<u64>) -> Result<String, DeviceError>;

    /// Fails with `Busy` while a print is in flight, leaving the running job untouched.
    async fn start_print(&self, filename: &str) -> Result<(), DeviceError>;

    async fn pause(&self) -> Result<(), DeviceError>;

    async fn resume(&self) -> Result<(), DeviceError>;

    async fn stop(&self) -> Result<(), DeviceError>;

    async fn get_status(&self) -> PrinterState;
}

/// Remote name for a local model: its base name.
pub fn remote_file_name(path: &Path) -> Result<String, DeviceError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
        .ok_or_else(|| {
            DeviceError::InvalidState(format!("'{}' has no usable file name", path.display()))
        })
}
