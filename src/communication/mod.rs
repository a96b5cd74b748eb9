// src/communication/mod.rs - Control channel, command protocol and telemetry
pub mod commands;
pub mod protocol;
pub mod status_monitor;
pub mod tls;
pub mod transport;

pub use commands::{CalibrationOptions, Command, Fan, PrinterCommand, Reply};
pub use protocol::{CommandProtocol, ProtocolStats};
pub use status_monitor::{StatusMonitor, TelemetryUpdate};
pub use transport::{
    Backoff, ControlChannel, DeviceIdentity, DeviceSession, LinkEvents, LinkStats, SessionSettings,
    TelemetrySink, TransportSession,
};
