// src/error.rs - Device-side error taxonomy
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the transport, command protocol, file transfer and device facades.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Bad principal or access secret. Retrying cannot succeed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Transient link failure.
    #[error("network error: {0}")]
    Network(String),
    #[error("command {correlation_id} timed out after {after:?}")]
    Timeout {
        correlation_id: String,
        after: Duration,
    },
    #[error("not connected to device")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file of {size} bytes exceeds the upload limit of {limit} bytes")]
    Size { size: u64, limit: u64 },
    /// The device answered, but refused the command.
    #[error("command rejected by device: {0}")]
    Rejected(String),
    /// A print is already in flight on this device.
    #[error("device busy: {0}")]
    Busy(String),
    #[error("invalid device state: {0}")]
    InvalidState(String),
}

impl DeviceError {
    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::Network(_)
                | DeviceError::Timeout { .. }
                | DeviceError::Io(_)
                | DeviceError::NotConnected
        )
    }
}
