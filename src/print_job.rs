// src/print_job.rs - Job description, workflow states and the terminal result
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::PrinterState;

/// Model file format produced by the model collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelFormat {
    #[default]
    #[serde(rename = "stl")]
    Stl,
    #[serde(rename = "3mf")]
    ThreeMf,
    #[serde(rename = "obj")]
    Obj,
}

impl ModelFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Stl => "stl",
            ModelFormat::ThreeMf => "3mf",
            ModelFormat::Obj => "obj",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "stl" => Ok(ModelFormat::Stl),
            "3mf" => Ok(ModelFormat::ThreeMf),
            "obj" => Ok(ModelFormat::Obj),
            other => Err(format!("unknown model format '{}'", other)),
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// What to build, handed to the model collaborator as-is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeParams {
    pub shape: String,
    /// Named dimensions in millimetres, e.g. `size`, `radius`.
    pub dimensions: BTreeMap<String, f64>,
    /// Existing model file to use instead of generating one.
    pub source_path: Option<PathBuf>,
}

impl ShapeParams {
    pub fn new(shape: &str) -> Self {
        Self {
            shape: shape.to_string(),
            ..Default::default()
        }
    }

    pub fn with_dimension(mut self, name: &str, millimetres: f64) -> Self {
        self.dimensions.insert(name.to_string(), millimetres);
        self
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let shape = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();
        Self {
            shape,
            dimensions: BTreeMap::new(),
            source_path: Some(path),
        }
    }
}

/// Caller's request for one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub shape: ShapeParams,
    pub output_format: ModelFormat,
    /// Push the model to the device. Implied by `start`.
    pub upload: bool,
    pub start: bool,
    /// Only meaningful with `start`.
    pub monitor: bool,
}

impl JobRequest {
    pub fn new(shape: ShapeParams, output_format: ModelFormat) -> Self {
        Self {
            shape,
            output_format,
            upload: false,
            start: false,
            monitor: false,
        }
    }

    pub fn with_upload(mut self) -> Self {
        self.upload = true;
        self
    }

    pub fn with_start(mut self, monitor: bool) -> Self {
        self.start = true;
        self.monitor = monitor;
        self
    }

    pub fn needs_device(&self) -> bool {
        self.upload || self.start
    }
}

/// A validated job. Built once the model exists and passed validation; never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub model_path: PathBuf,
    pub output_format: ModelFormat,
    pub upload_requested: bool,
    pub start_requested: bool,
    pub monitor_requested: bool,
}

impl Job {
    pub fn new(id: &str, model_path: PathBuf, request: &JobRequest) -> Self {
        Self {
            id: id.to_string(),
            model_path,
            output_format: request.output_format,
            upload_requested: request.needs_device(),
            start_requested: request.start,
            monitor_requested: request.start && request.monitor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Created,
    ModelReady,
    Validated,
    Uploaded,
    PrintStarted,
    Monitoring,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    /// Forward edges of the workflow graph. `Failed` is reachable from any
    /// non-terminal state; `Completed` from any state at which the run may stop.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Created, ModelReady) => true,
            (ModelReady, Validated) | (ModelReady, Completed) => true,
            (Validated, Uploaded) | (Validated, Completed) => true,
            (Uploaded, PrintStarted) | (Uploaded, Completed) => true,
            (PrintStarted, Monitoring) | (PrintStarted, Completed) => true,
            (Monitoring, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Work product exists but the run stopped short: validation issues, or
    /// monitoring gave up while the print may still be running.
    PartiallySucceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ModelCreation,
    Validation,
    Connect,
    Upload,
    StartPrint,
    /// The device reported an error or the print was cancelled on the device.
    PrintFailed,
    MonitorTimeout,
    Cancelled,
}

/// Why a run did not fully succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    /// State the workflow was in when the problem occurred.
    pub phase: WorkflowState,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, phase: WorkflowState, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} during {}: {}", self.kind, self.phase, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateVisit {
    pub state: WorkflowState,
    pub at: DateTime<Utc>,
}

/// Terminal result of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub job_id: String,
    pub outcome: Outcome,
    pub produced_path: Option<PathBuf>,
    pub remote_name: Option<String>,
    /// Last state reached; `Completed` or `Failed`.
    pub reached: WorkflowState,
    pub trace: Vec<StateVisit>,
    pub error: Option<FailureDetail>,
    pub validation_issues: Vec<String>,
    pub last_status: Option<PrinterState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// States visited, in order.
    pub fn states(&self) -> Vec<WorkflowState> {
        self.trace.iter().map(|visit| visit.state).collect()
    }

    pub fn visited(&self, state: WorkflowState) -> bool {
        self.trace.iter().any(|visit| visit.state == state)
    }
}

/// Mutable record of a run in progress. Consumed by `finish`, so a result is
/// produced exactly once.
#[derive(Debug)]
pub struct RunRecord {
    job_id: String,
    state: WorkflowState,
    trace: Vec<StateVisit>,
    started_at: DateTime<Utc>,
    pub produced_path: Option<PathBuf>,
    pub remote_name: Option<String>,
    pub validation_issues: Vec<String>,
    pub last_status: Option<PrinterState>,
}

impl RunRecord {
    pub fn new(job_id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            state: WorkflowState::Created,
            trace: vec![StateVisit {
                state: WorkflowState::Created,
                at: now,
            }],
            started_at: now,
            produced_path: None,
            remote_name: None,
            validation_issues: Vec::new(),
            last_status: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Move to `next`. Illegal edges are logged and ignored.
    pub fn advance(&mut self, next: WorkflowState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!("Ignoring illegal workflow transition {} -> {}", self.state, next);
            return;
        }
        tracing::info!("Job {}: {} -> {}", self.job_id, self.state, next);
        self.state = next;
        self.trace.push(StateVisit {
            state: next,
            at: Utc::now(),
        });
    }

    pub fn finish(mut self, outcome: Outcome, error: Option<FailureDetail>) -> WorkflowResult {
        let terminal = match outcome {
            Outcome::Failed => WorkflowState::Failed,
            _ => WorkflowState::Completed,
        };
        self.advance(terminal);
        WorkflowResult {
            job_id: self.job_id,
            outcome,
            produced_path: self.produced_path,
            remote_name: self.remote_name,
            reached: self.state,
            trace: self.trace,
            error,
            validation_issues: self.validation_issues,
            last_status: self.last_status,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
