// Autoseg Library - client orchestration for a remote DICOM segmentation service
// This exposes the core components for the CLI and integration tests

pub mod backend;
pub mod config;
pub mod observability;
pub mod poller;
pub mod staging;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use backend::{
    Backend, BackendError, HttpBackend, Job, JobClient, JobId, JobStatus, JobType, ResultRef,
    StagedFile, StagingBackend, UploadFile, WorkflowBackend,
};
pub use config::AutosegConfig;
pub use observability::{backend_metrics, BackendApiMetrics, OperationTimer};
pub use poller::{ChannelObserver, PollEvent, PollObserver, PollSettings, ProgressPoller};
pub use staging::{StagingInventory, StagingOutcome, StagingReport};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use workflow::{AdvanceOutcome, Stage, WorkflowSnapshot, WorkflowStateMachine};
