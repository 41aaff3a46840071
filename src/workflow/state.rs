use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::fmt;

use crate::backend::{Job, JobId, JobStatus, ResultRef};

pub const DEFAULT_STATUS_MESSAGE: &str = "Waiting for staged files to be validated.";
pub const GENERIC_FAILURE_MESSAGE: &str = "An error has occurred.";
pub const PROCESSING_STARTED_MESSAGE: &str = "Processing staged files...";
pub const PROCESSING_COMPLETE_MESSAGE: &str = "Processing complete. Ready to download.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Idle,
    Validating,
    Processing,
    Downloading,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Validating => "validating",
            Stage::Processing => "processing",
            Stage::Downloading => "downloading",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

/// Inputs to the workflow state machine. Produced only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    ValidationStarted,
    ValidationPassed { message: String },
    ValidationFailed { message: String },
    ProcessingRequested,
    JobStarted { job: Job },
    JobRejected { reason: String },
    JobProgress { job_id: JobId, progress: u8 },
    JobCompleted { job_id: JobId, result: ResultRef },
    JobFailed { job_id: JobId, reason: String },
    DownloadStarted,
    DownloadFinished { message: String },
    DownloadFailed { reason: String },
    FilesCounted { count: usize },
    Reset,
}

/// The single workflow context. Fields change only inside state handlers.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    stage: Stage,
    active_job: Option<Job>,
    status_message: String,
    file_count: usize,
    ready_to_process: bool,
    download_ref: Option<ResultRef>,
    call_in_flight: bool,
    transitions: Vec<StageTransition>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            active_job: None,
            status_message: DEFAULT_STATUS_MESSAGE.to_string(),
            file_count: 0,
            ready_to_process: false,
            download_ref: None,
            call_in_flight: false,
            transitions: Vec::new(),
        }
    }
}

#[state_machine(initial = "State::idle()")]
impl WorkflowState {
    #[state]
    fn idle(&mut self, event: &WorkflowEvent) -> Outcome<State> {
        match event {
            WorkflowEvent::ValidationStarted => {
                self.call_in_flight = true;
                self.ready_to_process = false;
                self.status_message = "Validating staged files...".to_string();
                self.enter(Stage::Validating);
                Transition(State::validating())
            }
            _ => self.handle_common(event),
        }
    }

    #[state]
    fn validating(&mut self, event: &WorkflowEvent) -> Outcome<State> {
        match event {
            WorkflowEvent::ValidationPassed { message } => {
                self.call_in_flight = false;
                self.ready_to_process = true;
                self.status_message = message.clone();
                tracing::info!(message = %message, "Validation passed, ready to process");
                Handled
            }
            WorkflowEvent::ValidationFailed { message } => {
                self.call_in_flight = false;
                self.ready_to_process = false;
                self.status_message = message.clone();
                tracing::warn!(message = %message, "Validation rejected");
                self.enter(Stage::Idle);
                Transition(State::idle())
            }
            WorkflowEvent::ProcessingRequested if self.ready_to_process => {
                self.call_in_flight = true;
                Handled
            }
            WorkflowEvent::JobStarted { job } if self.ready_to_process => {
                self.call_in_flight = false;
                self.ready_to_process = false;
                self.active_job = Some(job.clone());
                self.status_message = PROCESSING_STARTED_MESSAGE.to_string();
                tracing::info!(job_id = %job.id, "Processing job started");
                self.enter(Stage::Processing);
                Transition(State::processing())
            }
            WorkflowEvent::JobRejected { reason } => {
                self.call_in_flight = false;
                self.ready_to_process = false;
                self.status_message = GENERIC_FAILURE_MESSAGE.to_string();
                tracing::error!(reason = %reason, "Could not create processing job");
                self.enter(Stage::Idle);
                Transition(State::idle())
            }
            _ => self.handle_common(event),
        }
    }

    #[state]
    fn processing(&mut self, event: &WorkflowEvent) -> Outcome<State> {
        match event {
            WorkflowEvent::JobProgress { job_id, progress } => {
                if let Some(job) = self.active_job.as_mut().filter(|job| job.id == *job_id) {
                    job.status = JobStatus::Running;
                    job.progress = *progress;
                    self.status_message = format!("Processing... {progress}%");
                }
                Handled
            }
            WorkflowEvent::JobCompleted { job_id, result } if self.owns(job_id) => {
                if let Some(job) = self.active_job.as_mut() {
                    job.status = JobStatus::Succeeded;
                    job.progress = 100;
                    job.result = Some(result.clone());
                }
                self.download_ref = Some(result.clone());
                self.status_message = PROCESSING_COMPLETE_MESSAGE.to_string();
                tracing::info!(job_id = %job_id, result = %result, "Processing finished");
                self.enter(Stage::Downloading);
                Transition(State::downloading())
            }
            WorkflowEvent::JobFailed { job_id, reason } if self.owns(job_id) => {
                self.active_job = None;
                self.status_message = GENERIC_FAILURE_MESSAGE.to_string();
                tracing::error!(job_id = %job_id, reason = %reason, "Processing job failed");
                self.enter(Stage::Idle);
                Transition(State::idle())
            }
            _ => self.handle_common(event),
        }
    }

    #[state]
    fn downloading(&mut self, event: &WorkflowEvent) -> Outcome<State> {
        match event {
            WorkflowEvent::DownloadStarted => {
                self.call_in_flight = true;
                Handled
            }
            WorkflowEvent::DownloadFinished { message } => {
                self.call_in_flight = false;
                self.status_message = message.clone();
                Handled
            }
            WorkflowEvent::DownloadFailed { reason } => {
                self.call_in_flight = false;
                self.active_job = None;
                self.download_ref = None;
                self.status_message = GENERIC_FAILURE_MESSAGE.to_string();
                tracing::error!(reason = %reason, "Result download failed");
                self.enter(Stage::Idle);
                Transition(State::idle())
            }
            _ => self.handle_common(event),
        }
    }
}

impl WorkflowState {
    /// Events accepted in every stage.
    fn handle_common(&mut self, event: &WorkflowEvent) -> Outcome<State> {
        match event {
            WorkflowEvent::FilesCounted { count } => {
                self.file_count = *count;
                Handled
            }
            WorkflowEvent::Reset => {
                self.active_job = None;
                self.download_ref = None;
                self.ready_to_process = false;
                self.call_in_flight = false;
                self.status_message = DEFAULT_STATUS_MESSAGE.to_string();
                self.enter(Stage::Idle);
                tracing::info!("Workflow reset");
                Transition(State::idle())
            }
            other => {
                tracing::debug!(stage = %self.stage, event = ?other, "Event ignored in current stage");
                Handled
            }
        }
    }

    fn enter(&mut self, to: Stage) {
        let from = self.stage;
        if from != to {
            self.transitions.push(StageTransition {
                from,
                to,
                at: Utc::now(),
            });
        }
        self.stage = to;
    }

    fn owns(&self, job_id: &JobId) -> bool {
        self.active_job.as_ref().is_some_and(|job| job.id == *job_id)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn active_job(&self) -> Option<&Job> {
        self.active_job.as_ref()
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn ready_to_process(&self) -> bool {
        self.ready_to_process
    }

    pub fn download_ref(&self) -> Option<&ResultRef> {
        self.download_ref.as_ref()
    }

    pub fn transitions(&self) -> &[StageTransition] {
        &self.transitions
    }

    pub fn has_outstanding_job(&self) -> bool {
        self.active_job.as_ref().is_some_and(Job::is_outstanding)
    }

    /// True while a backend call or a job is outstanding.
    pub fn is_busy(&self) -> bool {
        self.call_in_flight || self.has_outstanding_job()
    }

    pub fn count_transitions(&self, from: Stage, to: Stage) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.from == from && t.to == to)
            .count()
    }
}

/// Read-only copy of the workflow state published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSnapshot {
    pub stage: Stage,
    pub active_job: Option<Job>,
    pub status_message: String,
    pub file_count: usize,
    pub ready_to_process: bool,
    pub download_ref: Option<ResultRef>,
    pub busy: bool,
}

impl From<&WorkflowState> for WorkflowSnapshot {
    fn from(state: &WorkflowState) -> Self {
        Self {
            stage: state.stage,
            active_job: state.active_job.clone(),
            status_message: state.status_message.clone(),
            file_count: state.file_count,
            ready_to_process: state.ready_to_process,
            download_ref: state.download_ref.clone(),
            busy: state.is_busy(),
        }
    }
}
