//! # Configuration
//!
//! One TOML file describes the device, the session tuning, the transfer limits,
//! the workflow defaults and the simulator.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [printer]
//! host = "192.168.1.50"
//! serial = "01P00A123456789"
//! access_code = "12345678"
//!
//! [session]
//! command_timeout_secs = 30
//! backoff_initial_ms = 1000
//! backoff_max_ms = 60000
//!
//! [workflow]
//! output_format = "3mf"
//! poll_interval_ms = 5000
//! monitor_timeout_secs = 14400   # 0 monitors without a deadline
//! stop_timeout_ms = 5000
//! ```
//!
//! Secrets may be left out of the file and supplied through the environment:
//! `FAB_PRINTER_IP`, `FAB_PRINTER_SERIAL`, `FAB_PRINTER_ACCESS_CODE`, and
//! `FAB_MOCK_MODE` (any of `1`, `true`, `yes` turns the simulator on).

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::print_job::ModelFormat;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Device address and credentials.
#[derive(Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub access_code: String,
    #[serde(default = "default_principal")]
    pub principal: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

// The access code never reaches logs.
impl std::fmt::Debug for PrinterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterConfig")
            .field("host", &self.host)
            .field("serial", &self.serial)
            .field("access_code", &"****")
            .field("principal", &self.principal)
            .field("control_port", &self.control_port)
            .field("transfer_port", &self.transfer_port)
            .field("remote_dir", &self.remote_dir)
            .finish()
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            serial: String::new(),
            access_code: String::new(),
            principal: default_principal(),
            control_port: default_control_port(),
            transfer_port: default_transfer_port(),
            remote_dir: default_remote_dir(),
        }
    }
}

/// Control-channel session tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// File transfer limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            chunk_size: default_chunk_size(),
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

impl TransferConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Defaults for a workflow run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub output_format: ModelFormat,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// `0` disables the monitoring timeout entirely.
    #[serde(default = "default_monitor_timeout_secs")]
    pub monitor_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub upload: bool,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub monitor: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            output_format: ModelFormat::default(),
            poll_interval_ms: default_poll_interval_ms(),
            monitor_timeout_secs: default_monitor_timeout_secs(),
            stop_timeout_ms: default_stop_timeout_ms(),
            upload: false,
            start: false,
            monitor: false,
        }
    }
}

impl WorkflowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn monitor_timeout(&self) -> Option<Duration> {
        (self.monitor_timeout_secs > 0).then(|| Duration::from_secs(self.monitor_timeout_secs))
    }
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Simulated device pacing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_progress_per_tick")]
    pub progress_per_tick: u8,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            progress_per_tick: default_progress_per_tick(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl SimulatorConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Config {
    /// Apply `FAB_*` overrides. `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("FAB_PRINTER_IP") {
            self.printer.host = host;
        }
        if let Some(serial) = lookup("FAB_PRINTER_SERIAL") {
            self.printer.serial = serial;
        }
        if let Some(code) = lookup("FAB_PRINTER_ACCESS_CODE") {
            self.printer.access_code = code;
        }
        if let Some(mock) = lookup("FAB_MOCK_MODE") {
            self.simulator.enabled = matches!(
                mock.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Reject configurations that cannot drive a device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.simulator.enabled {
            if self.printer.host.is_empty() {
                return Err(ConfigError::Invalid("printer.host must be set".to_string()));
            }
            if self.printer.serial.is_empty() {
                return Err(ConfigError::Invalid("printer.serial must be set".to_string()));
            }
            if self.printer.access_code.is_empty() {
                return Err(ConfigError::Invalid(
                    "printer.access_code must be set (or FAB_PRINTER_ACCESS_CODE)".to_string(),
                ));
            }
        }
        if self.printer.control_port == self.printer.transfer_port {
            return Err(ConfigError::Invalid(
                "control_port and transfer_port must differ".to_string(),
            ));
        }
        if self.session.command_timeout_secs == 0 || self.session.backoff_initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "session timeouts and backoff must be > 0".to_string(),
            ));
        }
        if self.session.backoff_max_ms < self.session.backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "backoff_max_ms must be >= backoff_initial_ms".to_string(),
            ));
        }
        if self.workflow.stop_timeout_ms == 0 {
            return Err(ConfigError::Invalid("workflow.stop_timeout_ms must be > 0".to_string()));
        }
        if self.workflow.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("workflow.poll_interval_ms must be > 0".to_string()));
        }
        if self.simulator.progress_per_tick == 0 || self.simulator.progress_per_tick > 100 {
            return Err(ConfigError::Invalid(
                "simulator.progress_per_tick must be within 1..=100".to_string(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid("transfer.chunk_size must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_principal() -> String { "bblp".to_string() }
fn default_control_port() -> u16 { 8883 }
fn default_transfer_port() -> u16 { 990 }
fn default_remote_dir() -> String { "/cache".to_string() }
fn default_command_timeout_secs() -> u64 { 30 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_keep_alive_secs() -> u64 { 30 }
fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_sweep_interval_ms() -> u64 { 1_000 }
fn default_max_upload_bytes() -> u64 { 1024 * 1024 * 1024 }
fn default_chunk_size() -> usize { 8192 }
fn default_io_timeout_secs() -> u64 { 30 }
fn default_poll_interval_ms() -> u64 { 5_000 }
fn default_monitor_timeout_secs() -> u64 { 4 * 60 * 60 }
fn default_stop_timeout_ms() -> u64 { 5_000 }
fn default_progress_per_tick() -> u8 { 1 }
fn default_tick_ms() -> u64 { 500 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
