// src/workflow/mod.rs - Orchestrates model -> validation -> upload -> print -> monitor
pub mod collaborators;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::WorkflowConfig;
use crate::device::{DeviceFacade, PrintPhase};
use crate::print_job::{
    FailureDetail, FailureKind, Job, JobRequest, Outcome, RunRecord, WorkflowResult, WorkflowState,
};

pub use collaborators::{
    BasicMeshValidator, CollaboratorError, FileModelSource, MeshValidator, ModelSource,
};

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub poll_interval: Duration,
    /// `None` monitors until the print reaches a terminal phase.
    pub monitor_timeout: Option<Duration>,
    /// How long a cancelled run waits for the device to confirm `stop`.
    pub stop_timeout: Duration,
}

impl WorkflowSettings {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            monitor_timeout: config.monitor_timeout(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}

/// Cancels the orchestrator it came from. Cloneable and cheap.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        tracing::info!("Workflow cancellation requested");
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Outcome of the device stages, before the run record is closed.
type StageResult = Result<(), (Outcome, FailureDetail)>;

/// Drives one job through the workflow against whichever device it was given.
pub struct WorkflowOrchestrator {
    device: Arc<dyn DeviceFacade>,
    model_source: Arc<dyn ModelSource>,
    validator: Arc<dyn MeshValidator>,
    settings: WorkflowSettings,
    cancel_tx: watch::Sender<bool>,
}

impl WorkflowOrchestrator {
    pub fn new(
        device: Arc<dyn DeviceFacade>,
        model_source: Arc<dyn ModelSource>,
        validator: Arc<dyn MeshValidator>,
        settings: WorkflowSettings,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            device,
            model_source,
            validator,
            settings,
            cancel_tx,
        }
    }

    /// Handle that cancels every current and later run of this orchestrator.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    pub fn device(&self) -> Arc<dyn DeviceFacade> {
        self.device.clone()
    }

    /// Run one job to a terminal result. Never panics on collaborator or device
    /// failure; every path ends in a `WorkflowResult`.
    ///
    /// A successful `connect` is always paired with exactly one `disconnect`, so
    /// runs sharing a device never close each other's session.
    pub async fn run(&self, request: JobRequest) -> WorkflowResult {
        let job_id = uuid::Uuid::new_v4().to_string();
        let mut record = RunRecord::new(&job_id);
        tracing::info!(
            "Job {}: shape '{}' as {} (upload: {}, start: {}, monitor: {})",
            job_id,
            request.shape.shape,
            request.output_format,
            request.needs_device(),
            request.start,
            request.monitor
        );

        // Created -> ModelReady
        let model_path = match self
            .model_source
            .create_model(&request.shape, request.output_format)
        {
            Ok(path) if path.is_file() => path,
            Ok(path) => {
                let detail = FailureDetail::new(
                    FailureKind::ModelCreation,
                    record.state(),
                    format!("model collaborator returned missing file {}", path.display()),
                );
                return self.finish(record, Outcome::Failed, Some(detail));
            }
            Err(e) => {
                let detail = FailureDetail::new(FailureKind::ModelCreation, record.state(), e.to_string());
                return self.finish(record, Outcome::Failed, Some(detail));
            }
        };
        record.produced_path = Some(model_path.clone());
        record.advance(WorkflowState::ModelReady);

        // ModelReady -> Validated
        if let Err(issues) = self.validator.validate_mesh(&model_path) {
            tracing::warn!("Job {}: validation reported {} issue(s)", job_id, issues.len());
            let detail = FailureDetail::new(
                FailureKind::Validation,
                record.state(),
                format!("printing skipped: {}", issues.join("; ")),
            );
            record.validation_issues = issues;
            return self.finish(record, Outcome::PartiallySucceeded, Some(detail));
        }
        record.advance(WorkflowState::Validated);
        let job = Job::new(&job_id, model_path, &request);

        if !job.upload_requested {
            return self.finish(record, Outcome::Succeeded, None);
        }

        let staged = match self.lease_device(&record).await {
            Ok(()) => {
                let staged = self.run_device_stages(&job, &mut record).await;
                record.last_status = Some(self.device.get_status().await);
                self.device.disconnect().await;
                staged
            }
            Err(failure) => {
                record.last_status = Some(self.device.get_status().await);
                Err(failure)
            }
        };

        match staged {
            Ok(()) => self.finish(record, Outcome::Succeeded, None),
            Err((outcome, detail)) => self.finish(record, outcome, Some(detail)),
        }
    }

    async fn lease_device(&self, record: &RunRecord) -> StageResult {
        match self.until_cancelled(record, self.device.connect()).await? {
            Ok(()) => Ok(()),
            Err(e) => Err(failed(FailureKind::Connect, record, e.to_string())),
        }
    }

    async fn run_device_stages(&self, job: &Job, record: &mut RunRecord) -> StageResult {
        // Validated -> Uploaded
        let size_hint = tokio::fs::metadata(&job.model_path).await.ok().map(|m| m.len());
        let uploaded = self
            .until_cancelled(record, self.device.upload_file(&job.model_path, size_hint))
            .await?;
        let remote_name = match uploaded {
            Ok(name) => name,
            Err(e) => return Err(failed(FailureKind::Upload, record, e.to_string())),
        };
        record.remote_name = Some(remote_name.clone());
        record.advance(WorkflowState::Uploaded);
        if !job.start_requested {
            return Ok(());
        }

        // Uploaded -> PrintStarted
        let started = match self.until_cancelled(record, self.device.start_print(&remote_name)).await {
            Ok(started) => started,
            Err(cancelled) => {
                // The start command may have reached the device already.
                self.stop_device(record).await;
                return Err(cancelled);
            }
        };
        if let Err(e) = started {
            return Err(failed(FailureKind::StartPrint, record, e.to_string()));
        }
        record.advance(WorkflowState::PrintStarted);
        if !job.monitor_requested {
            return Ok(());
        }

        // PrintStarted -> Monitoring -> terminal
        record.advance(WorkflowState::Monitoring);
        self.monitor(record).await
    }

    async fn monitor(&self, record: &mut RunRecord) -> StageResult {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let deadline = self.settings.monitor_timeout.map(|t| Instant::now() + t);
        let mut last_progress = None;

        loop {
            let status = self.device.get_status().await;
            if last_progress != Some(status.progress_percent) {
                tracing::info!(
                    "Job {}: {:?} {}% (layer {}/{})",
                    record.job_id(),
                    status.print_phase,
                    status.progress_percent,
                    status.layer_current,
                    status.layer_total
                );
                last_progress = Some(status.progress_percent);
            }
            let phase = status.print_phase;
            let device_error = status.last_error.clone();
            record.last_status = Some(status);

            match phase {
                PrintPhase::Completed => return Ok(()),
                PrintPhase::Cancelled => {
                    return Err(failed(FailureKind::PrintFailed, record, "print cancelled on device"));
                }
                PrintPhase::Error => {
                    let message = device_error.unwrap_or_else(|| "device reported an error".to_string());
                    return Err(failed(FailureKind::PrintFailed, record, message));
                }
                _ => {}
            }

            let mut wait = self.settings.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!("Job {}: monitoring timed out, print may still be running", record.job_id());
                    return Err((
                        Outcome::PartiallySucceeded,
                        FailureDetail::new(
                            FailureKind::MonitorTimeout,
                            record.state(),
                            format!("no terminal state after {:?}", self.settings.monitor_timeout.unwrap_or_default()),
                        ),
                    ));
                }
                wait = wait.min(deadline - now);
            }

            tokio::select! {
                _ = wait_cancelled(&mut cancel_rx) => {
                    self.stop_device(record).await;
                    return Err(failed(FailureKind::Cancelled, record, "cancelled by caller"));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Await a device call unless the run is cancelled first. An already
    /// cancelled run never starts the call.
    async fn until_cancelled<T>(
        &self,
        record: &RunRecord,
        call: impl Future<Output = T>,
    ) -> Result<T, (Outcome, FailureDetail)> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel_rx) => {
                Err(failed(FailureKind::Cancelled, record, "cancelled by caller"))
            }
            value = call => Ok(value),
        }
    }

    /// Best-effort stop, bounded by `stop_timeout`.
    async fn stop_device(&self, record: &RunRecord) {
        match tokio::time::timeout(self.settings.stop_timeout, self.device.stop()).await {
            Ok(Ok(())) => tracing::info!("Job {}: print stopped", record.job_id()),
            Ok(Err(e)) => tracing::warn!("Job {}: stop after cancellation failed: {}", record.job_id(), e),
            Err(_) => tracing::warn!(
                "Job {}: device did not confirm stop within {:?}",
                record.job_id(),
                self.settings.stop_timeout
            ),
        }
    }

    fn finish(&self, record: RunRecord, outcome: Outcome, error: Option<FailureDetail>) -> WorkflowResult {
        let result = record.finish(outcome, error);
        match &result.error {
            None => tracing::info!("Job {} finished: {:?}", result.job_id, result.outcome),
            Some(detail) => tracing::warn!("Job {} finished: {:?} ({})", result.job_id, result.outcome, detail),
        }
        result
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn failed(kind: FailureKind, record: &RunRecord, message: impl Into<String>) -> (Outcome, FailureDetail) {
    (Outcome::Failed, FailureDetail::new(kind, record.state(), message))
}
