// Backend boundary - jobs, staging and workflow endpoints of the
// segmentation service.

pub mod client;
pub mod errors;
pub mod traits;
pub mod types;

#[cfg(test)]
pub mod mocks;

pub use client::HttpBackend;
pub use errors::BackendError;
pub use traits::{Backend, JobClient, StagingBackend, WorkflowBackend};
pub use types::{
    DownloadedResult, Job, JobId, JobStatus, JobType, ResultRef, StagedFile, UploadFile,
};
