// Backend seams - the workflow only ever talks to these traits so tests can
// substitute scripted or mocked implementations.

use async_trait::async_trait;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use super::errors::BackendError;
use super::types::{DownloadedResult, JobId, JobType, ResultRef, StagedFile, UploadFile};

/// Remote job lifecycle. Stateless beyond the in-flight request.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Create a trackable job and return its opaque id.
    async fn create_job(&self, job_type: JobType) -> Result<JobId, BackendError>;

    /// Current progress of the job, 0..=100.
    async fn get_progress(&self, id: &JobId) -> Result<u8, BackendError>;

    /// Result reference of a finished job.
    async fn get_result(&self, id: &JobId) -> Result<ResultRef, BackendError>;

    /// Ask the backend to abandon a job. Best effort.
    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError>;
}

/// Server-side staging area for uploaded files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StagingBackend: Send + Sync {
    async fn list_files(&self) -> Result<Vec<StagedFile>, BackendError>;

    /// Post files, reporting progress against `thread_id` when given.
    async fn upload_files(
        &self,
        thread_id: Option<JobId>,
        files: Vec<UploadFile>,
    ) -> Result<(), BackendError>;

    async fn cleanup(&self) -> Result<(), BackendError>;
}

/// Synchronous workflow endpoints that are not jobs.
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    /// Validate the staged files, returning the server's status text.
    async fn validate(&self) -> Result<String, BackendError>;

    async fn download(&self, file_id: &ResultRef) -> Result<DownloadedResult, BackendError>;
}

/// Everything the orchestrator needs from the backend.
pub trait Backend: JobClient + StagingBackend + WorkflowBackend {
    /// Upcast used when handing the job half to a poller.
    fn as_job_client(self: Arc<Self>) -> Arc<dyn JobClient>;

    fn as_staging_backend(self: Arc<Self>) -> Arc<dyn StagingBackend>;
}

impl<T> Backend for T
where
    T: JobClient + StagingBackend + WorkflowBackend + 'static,
{
    fn as_job_client(self: Arc<Self>) -> Arc<dyn JobClient> {
        self
    }

    fn as_staging_backend(self: Arc<Self>) -> Arc<dyn StagingBackend> {
        self
    }
}
