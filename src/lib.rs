//! Job submission and tracking for networked 3D printers.
//!
//! A [`workflow::WorkflowOrchestrator`] takes a model from an external
//! collaborator, validates it, pushes it to a [`device::DeviceFacade`], starts the
//! print and follows it to completion. The facade is either a real printer
//! ([`device::network::NetworkDevice`]: MQTT over TLS for control and telemetry,
//! implicit FTPS for files) or a deterministic [`simulator::SimulatedDevice`].

pub mod communication;
pub mod config;
pub mod device;
pub mod error;
pub mod file_transfer;
pub mod print_job;
pub mod simulator;
pub mod workflow;

pub use device::{ConnectionPhase, DeviceFacade, PrintPhase, PrinterState};
pub use error::DeviceError;
pub use print_job::{JobRequest, ModelFormat, Outcome, ShapeParams, WorkflowResult, WorkflowState};
pub use workflow::WorkflowOrchestrator;
