//! Local view of the backend's staging area.
//!
//! The inventory never adjusts its file list optimistically: every upload and
//! cleanup, successful or not, ends with a refresh from the server.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, Job, JobClient, JobId, JobType, ResultRef, StagedFile, StagingBackend,
    UploadFile,
};
use crate::config::{PollingConfig, StagingConfig};
use crate::poller::{PollObserver, PollSettings, ProgressPoller};

pub const UPLOAD_SUCCEEDED_MESSAGE: &str = "Files successfully uploaded";
pub const UPLOAD_FAILED_MESSAGE: &str = "Failed to upload";
pub const CLEAR_SUCCEEDED_MESSAGE: &str = "Files cleared successfully";
pub const CLEAR_FAILED_MESSAGE: &str = "Files not cleared";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingOutcome {
    Succeeded,
    Failed,
}

/// User-facing summary of an upload or cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingReport {
    pub outcome: StagingOutcome,
    pub message: String,
    /// Server-reported count after the operation.
    pub file_count: usize,
    /// Selected files that were not sent because of their extension.
    pub skipped: Vec<String>,
}

impl StagingReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == StagingOutcome::Succeeded
    }
}

/// Publishes upload progress on a watch channel.
struct UploadProgress {
    tx: Arc<watch::Sender<u8>>,
}

impl PollObserver for UploadProgress {
    fn on_update(&self, job_id: &JobId, _seq: u64, progress: u8) {
        self.tx.send_if_modified(|current| {
            if progress > *current {
                *current = progress;
                true
            } else {
                false
            }
        });
        debug!(job_id = %job_id, progress, "Upload progress");
    }

    fn on_complete(&self, job_id: &JobId, _result: Option<ResultRef>) {
        debug!(job_id = %job_id, "Upload job reported completion");
    }

    fn on_error(&self, job_id: &JobId, error: BackendError) {
        // progress is advisory; the POST decides the outcome
        debug!(job_id = %job_id, error = %error, "Upload progress unavailable");
    }
}

pub struct StagingInventory {
    jobs: Arc<dyn JobClient>,
    backend: Arc<dyn StagingBackend>,
    polling: PollingConfig,
    allowed_extensions: Vec<String>,
    files: Vec<StagedFile>,
    progress: Arc<watch::Sender<u8>>,
}

impl StagingInventory {
    pub fn new(
        jobs: Arc<dyn JobClient>,
        backend: Arc<dyn StagingBackend>,
        polling: PollingConfig,
        staging: &StagingConfig,
    ) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            jobs,
            backend,
            polling,
            allowed_extensions: staging.allowed_extensions.clone(),
            files: Vec::new(),
            progress: Arc::new(progress),
        }
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Progress (0..=100) of the most recent upload.
    pub fn subscribe_upload_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// Replace the local list with the server's.
    pub async fn refresh(&mut self) -> Result<usize, BackendError> {
        let files = self.backend.list_files().await?;
        self.files = files;
        info!(file_count = self.files.len(), "Staging inventory refreshed");
        Ok(self.files.len())
    }

    /// Remove every staged file on the server, then refresh.
    ///
    /// Backend failures end up in the report rather than in the error.
    pub async fn clear(&mut self) -> Result<StagingReport, BackendError> {
        let outcome = match self.backend.cleanup().await {
            Ok(()) => StagingOutcome::Succeeded,
            Err(e) => {
                warn!(error = %e, "Staging cleanup failed");
                StagingOutcome::Failed
            }
        };

        let file_count = self.refresh_after_change().await;
        let message = match outcome {
            StagingOutcome::Succeeded => CLEAR_SUCCEEDED_MESSAGE,
            StagingOutcome::Failed => CLEAR_FAILED_MESSAGE,
        };
        Ok(StagingReport {
            outcome,
            message: message.to_string(),
            file_count,
            skipped: Vec::new(),
        })
    }

    /// Upload `files` as a tracked job, then refresh.
    /// The outcome reflects the POST alone.
    ///
    /// An empty selection, or one with no acceptable extension, is rejected
    /// before any request is made.
    pub async fn upload(&mut self, files: Vec<UploadFile>) -> Result<StagingReport, BackendError> {
        if files.is_empty() {
            return Err(BackendError::Validation("no files selected".to_string()));
        }

        let (accepted, rejected): (Vec<UploadFile>, Vec<UploadFile>) =
            files.into_iter().partition(|f| self.accepts(f));
        let skipped: Vec<String> = rejected.into_iter().map(|f| f.name).collect();
        if !skipped.is_empty() {
            warn!(skipped = ?skipped, "Skipping files with unsupported extensions");
        }
        if accepted.is_empty() {
            return Err(BackendError::Validation(format!(
                "no files with an accepted extension ({})",
                self.allowed_extensions.join(", ")
            )));
        }

        self.progress.send_replace(0);
        let outcome = self.post_tracked(accepted).await;

        let file_count = self.refresh_after_change().await;
        let message = match outcome {
            StagingOutcome::Succeeded => UPLOAD_SUCCEEDED_MESSAGE,
            StagingOutcome::Failed => UPLOAD_FAILED_MESSAGE,
        };
        Ok(StagingReport {
            outcome,
            message: message.to_string(),
            file_count,
            skipped,
        })
    }

    /// Refresh after a mutating call. The mutation already happened, so a
    /// failed listing keeps the last known count instead of failing the call.
    async fn refresh_after_change(&mut self) -> usize {
        match self.refresh().await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    error = %e,
                    file_count = self.files.len(),
                    "Staging refresh failed; keeping last known inventory"
                );
                self.files.len()
            }
        }
    }

    async fn post_tracked(&self, files: Vec<UploadFile>) -> StagingOutcome {
        let count = files.len();
        let job_id = match self.jobs.create_job(JobType::Upload).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Could not create upload job");
                return StagingOutcome::Failed;
            }
        };

        let job = Job::pending(job_id.clone(), JobType::Upload);
        let observer = Arc::new(UploadProgress {
            tx: self.progress.clone(),
        });
        let poller = ProgressPoller::start(
            self.jobs.clone(),
            &job,
            PollSettings::for_job(&self.polling, JobType::Upload),
            observer,
        );

        let posted = self.backend.upload_files(Some(job_id.clone()), files).await;
        poller.stop();

        match posted {
            Ok(()) => {
                self.progress.send_replace(100);
                info!(job_id = %job_id, file_count = count, "Upload finished");
                StagingOutcome::Succeeded
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Upload failed");
                StagingOutcome::Failed
            }
        }
    }

    fn accepts(&self, file: &UploadFile) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        file.extension()
            .map(|ext| self.allowed_extensions.iter().any(|allowed| *allowed == ext))
            .unwrap_or(false)
    }
}
