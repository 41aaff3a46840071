//! Workflow orchestration.
//!
//! [`WorkflowStateMachine`] is the single owner of workflow state. Backend
//! calls happen here; poll outcomes arrive on an mpsc channel and are applied
//! in order by the owner, so state is never mutated from a poll task.

use statig::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use super::state::{
    Stage, WorkflowEvent, WorkflowSnapshot, WorkflowState, GENERIC_FAILURE_MESSAGE,
};
use crate::backend::{
    Backend, BackendError, Job, JobClient, JobId, JobType, ResultRef, UploadFile, WorkflowBackend,
};
use crate::config::{AutosegConfig, PollingConfig};
use crate::observability::{backend_metrics, OperationTimer};
use crate::poller::{
    ChannelObserver, Observation, PollEvent, PollSettings, ProgressPoller, ProgressTracker,
};
use crate::staging::{StagingInventory, StagingReport};
use crate::telemetry::{create_workflow_span, generate_correlation_id};

/// What a single [`WorkflowStateMachine::advance`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Staged files passed validation; the next advance starts processing.
    Validated { message: String },
    /// Validation failed; the workflow is back in Idle.
    ValidationRejected { message: String },
    /// An inference job was created and is being polled.
    ProcessingStarted { job_id: JobId },
    /// The result was written to `path`.
    Downloaded { path: PathBuf, bytes: usize },
    /// A call or job is outstanding; nothing was done.
    Busy,
    /// A stage failed and the workflow returned to Idle.
    Failed { message: String },
}

struct PollEntry {
    poller: ProgressPoller,
    tracker: ProgressTracker,
}

pub struct WorkflowStateMachine {
    backend: Arc<dyn Backend>,
    machine: StateMachine<WorkflowState>,
    staging: StagingInventory,
    polling: PollingConfig,
    output_dir: PathBuf,
    pollers: HashMap<JobId, PollEntry>,
    events_tx: mpsc::UnboundedSender<PollEvent>,
    events_rx: mpsc::UnboundedReceiver<PollEvent>,
    snapshot_tx: watch::Sender<WorkflowSnapshot>,
}

impl WorkflowStateMachine {
    pub fn new(backend: Arc<dyn Backend>, config: &AutosegConfig) -> Self {
        let staging = StagingInventory::new(
            backend.clone().as_job_client(),
            backend.clone().as_staging_backend(),
            config.polling.clone(),
            &config.staging,
        );
        let machine = WorkflowState::default().state_machine();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(WorkflowSnapshot::from(machine.inner()));

        Self {
            backend,
            machine,
            staging,
            polling: config.polling.clone(),
            output_dir: config.download.output_dir.clone(),
            pollers: HashMap::new(),
            events_tx,
            events_rx,
            snapshot_tx,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        self.machine.inner()
    }

    pub fn stage(&self) -> Stage {
        self.state().stage()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot::from(self.state())
    }

    /// Observe every state change without holding the machine.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn staging(&self) -> &StagingInventory {
        &self.staging
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    /// Number of jobs currently being polled.
    pub fn active_pollers(&self) -> usize {
        self.pollers.len()
    }

    /// Move the workflow forward by one stage.
    ///
    /// Ignored while a call or job is outstanding, so repeated requests can
    /// never start a second job.
    pub async fn advance(&mut self) -> AdvanceOutcome {
        self.pump();
        let correlation_id = generate_correlation_id();
        let job_id = self.state().active_job().map(|job| job.id.to_string());
        let span = create_workflow_span(
            "advance",
            self.stage().as_str(),
            job_id.as_deref(),
            &correlation_id,
        );
        self.advance_stage().instrument(span).await
    }

    async fn advance_stage(&mut self) -> AdvanceOutcome {
        if self.is_busy() {
            debug!(stage = %self.stage(), "Advance ignored while busy");
            return AdvanceOutcome::Busy;
        }

        match self.stage() {
            Stage::Idle => self.validate().await,
            Stage::Validating if self.state().ready_to_process() => self.start_processing().await,
            Stage::Validating | Stage::Processing => AdvanceOutcome::Busy,
            Stage::Downloading => self.download().await,
        }
    }

    async fn validate(&mut self) -> AdvanceOutcome {
        self.apply(WorkflowEvent::ValidationStarted);
        let timer = OperationTimer::new("validate");
        let outcome = match self.backend.validate().await {
            Ok(message) => {
                self.apply(WorkflowEvent::ValidationPassed {
                    message: message.clone(),
                });
                AdvanceOutcome::Validated { message }
            }
            Err(e) => {
                let message = e.to_string();
                self.apply(WorkflowEvent::ValidationFailed {
                    message: message.clone(),
                });
                AdvanceOutcome::ValidationRejected { message }
            }
        };
        timer.finish();
        outcome
    }

    async fn start_processing(&mut self) -> AdvanceOutcome {
        self.apply(WorkflowEvent::ProcessingRequested);
        let job_id = match self.backend.create_job(JobType::Inference).await {
            Ok(id) => id,
            Err(e) => {
                self.apply(WorkflowEvent::JobRejected {
                    reason: e.to_string(),
                });
                return AdvanceOutcome::Failed {
                    message: GENERIC_FAILURE_MESSAGE.to_string(),
                };
            }
        };

        let job = Job::pending(job_id.clone(), JobType::Inference);
        let poller = ProgressPoller::start(
            self.backend.clone().as_job_client(),
            &job,
            PollSettings::for_job(&self.polling, JobType::Inference),
            Arc::new(ChannelObserver::new(self.events_tx.clone())),
        );
        self.pollers.insert(
            job_id.clone(),
            PollEntry {
                poller,
                tracker: ProgressTracker::new(),
            },
        );
        self.apply(WorkflowEvent::JobStarted { job });

        AdvanceOutcome::ProcessingStarted { job_id }
    }

    async fn download(&mut self) -> AdvanceOutcome {
        let Some(file_id) = self.state().download_ref().cloned() else {
            self.apply(WorkflowEvent::DownloadFailed {
                reason: "no result reference".to_string(),
            });
            return AdvanceOutcome::Failed {
                message: GENERIC_FAILURE_MESSAGE.to_string(),
            };
        };

        self.apply(WorkflowEvent::DownloadStarted);
        let timer = OperationTimer::new("download");
        let written = match self.backend.download(&file_id).await {
            Ok(result) => write_result(&self.output_dir, &result.file_id, &result.bytes)
                .await
                .map(|path| (path, result.bytes.len()))
                .map_err(|e| format!("could not write result: {e}")),
            Err(e) => Err(e.to_string()),
        };
        timer.finish();

        match written {
            Ok((path, bytes)) => {
                info!(file_id = %file_id, path = %path.display(), bytes, "Result downloaded");
                self.apply(WorkflowEvent::DownloadFinished {
                    message: format!("Result saved to {}", path.display()),
                });
                AdvanceOutcome::Downloaded { path, bytes }
            }
            Err(reason) => {
                self.apply(WorkflowEvent::DownloadFailed { reason });
                AdvanceOutcome::Failed {
                    message: GENERIC_FAILURE_MESSAGE.to_string(),
                }
            }
        }
    }

    /// Abandon whatever is in progress, clear the staging area and return to
    /// Idle. The file count is refreshed from the server afterwards.
    pub async fn reset(&mut self) -> Result<StagingReport, BackendError> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("reset", self.stage().as_str(), None, &correlation_id);
        self.reset_workflow().instrument(span).await
    }

    async fn reset_workflow(&mut self) -> Result<StagingReport, BackendError> {
        let outstanding: Vec<JobId> = self.pollers.keys().cloned().collect();
        for (_, entry) in self.pollers.drain() {
            entry.poller.stop();
        }
        // anything queued before the pollers stopped belongs to abandoned jobs
        while let Ok(event) = self.events_rx.try_recv() {
            debug!(job_id = %event.job_id(), "Discarding event from abandoned job");
            backend_metrics().record_stale_update();
        }

        for job_id in &outstanding {
            if let Err(e) = self.backend.cancel_job(job_id).await {
                warn!(job_id = %job_id, error = %e, "Could not cancel job on backend");
            }
        }

        self.apply(WorkflowEvent::Reset);

        let report = self.staging.clear().await?;
        self.apply(WorkflowEvent::FilesCounted {
            count: report.file_count,
        });
        Ok(report)
    }

    /// Apply every poll event that has already arrived. Returns how many were
    /// taken off the channel. A poll task that exited without reporting a
    /// terminal event fails its job.
    pub fn pump(&mut self) -> usize {
        // sample before draining: a finished task has queued all its events
        let exited: Vec<JobId> = self
            .pollers
            .iter()
            .filter(|(_, entry)| entry.poller.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_poll_event(event);
            applied += 1;
        }

        for job_id in exited {
            if self.pollers.contains_key(&job_id) {
                self.fail_exited_poller(job_id, Ok(()));
            }
        }
        applied
    }

    /// Wait until no job is outstanding, applying poll events as they arrive.
    pub async fn settle(&mut self) -> Stage {
        self.pump();
        while self.state().has_outstanding_job() {
            let Some(job_id) = self.state().active_job().map(|job| job.id.clone()) else {
                break;
            };
            let Some(entry) = self.pollers.get_mut(&job_id) else {
                break;
            };

            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.on_poll_event(event),
                    None => break,
                },
                exit = entry.poller.exited() => {
                    self.pump();
                    if self.pollers.contains_key(&job_id) {
                        self.fail_exited_poller(job_id, exit);
                    }
                }
            }
        }
        self.stage()
    }

    fn fail_exited_poller(&mut self, job_id: JobId, exit: Result<(), String>) {
        self.pollers.remove(&job_id);
        let reason = match exit {
            Ok(()) => "poll task exited without a result".to_string(),
            Err(error) => format!("poll task died: {error}"),
        };
        warn!(job_id = %job_id, reason = %reason, "Poller stopped unexpectedly");
        self.apply(WorkflowEvent::JobFailed { job_id, reason });
    }

    fn on_poll_event(&mut self, event: PollEvent) {
        let Some(entry) = self.pollers.get_mut(event.job_id()) else {
            debug!(job_id = %event.job_id(), "Event for unknown job discarded");
            backend_metrics().record_stale_update();
            return;
        };

        match event {
            PollEvent::Progress {
                job_id,
                seq,
                progress,
            } => match entry.tracker.observe(seq, progress) {
                Observation::Applied(progress) => {
                    self.apply(WorkflowEvent::JobProgress { job_id, progress });
                }
                Observation::Stale | Observation::Regressed => {
                    debug!(job_id = %job_id, seq, progress, "Out-of-order progress discarded");
                    backend_metrics().record_stale_update();
                }
            },
            PollEvent::Completed { job_id, result } => {
                self.retire(&job_id);
                match result {
                    Some(result) => self.apply(WorkflowEvent::JobCompleted { job_id, result }),
                    None => self.apply(WorkflowEvent::JobFailed {
                        job_id,
                        reason: "job finished without a result".to_string(),
                    }),
                }
            }
            PollEvent::Failed { job_id, error } => {
                self.retire(&job_id);
                self.apply(WorkflowEvent::JobFailed {
                    job_id,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn retire(&mut self, job_id: &JobId) {
        if let Some(entry) = self.pollers.remove(job_id) {
            entry.poller.stop();
        }
    }

    /// Upload files to the staging area and update the file count.
    pub async fn upload(&mut self, files: Vec<UploadFile>) -> Result<StagingReport, BackendError> {
        self.ensure_idle()?;
        let report = self.staging.upload(files).await?;
        self.apply(WorkflowEvent::FilesCounted {
            count: report.file_count,
        });
        Ok(report)
    }

    pub async fn refresh_files(&mut self) -> Result<usize, BackendError> {
        let count = self.staging.refresh().await?;
        self.apply(WorkflowEvent::FilesCounted { count });
        Ok(count)
    }

    pub async fn clear_files(&mut self) -> Result<StagingReport, BackendError> {
        self.ensure_idle()?;
        let report = self.staging.clear().await?;
        self.apply(WorkflowEvent::FilesCounted {
            count: report.file_count,
        });
        Ok(report)
    }

    /// Staging changes are refused while a call or job is outstanding.
    fn ensure_idle(&self) -> Result<(), BackendError> {
        if self.is_busy() {
            warn!(stage = %self.stage(), "Staging change refused while workflow is busy");
            return Err(BackendError::Validation(
                "workflow is busy; wait for the current job or reset".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, event: WorkflowEvent) {
        self.machine.handle(&event);
        self.snapshot_tx
            .send_replace(WorkflowSnapshot::from(self.machine.inner()));
    }
}

impl Drop for WorkflowStateMachine {
    fn drop(&mut self) {
        for entry in self.pollers.values() {
            entry.poller.stop();
        }
    }
}

/// Write a downloaded result under `output_dir`, named after its file id.
async fn write_result(
    output_dir: &Path,
    file_id: &ResultRef,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir).await?;
    let path = output_dir.join(result_file_name(file_id));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

fn result_file_name(file_id: &ResultRef) -> String {
    let base = Path::new(file_id.as_str())
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("result");
    if base.to_ascii_lowercase().ends_with(".dcm") {
        base.to_string()
    } else {
        format!("{base}.dcm")
    }
}
