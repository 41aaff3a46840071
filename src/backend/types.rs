use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle the backend assigns to a trackable job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a finished result file on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(pub String);

impl ResultRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Upload,
    Inference,
}

impl JobType {
    /// Value of the `threadtype` query parameter for job creation.
    pub fn thread_type(&self) -> &'static str {
        match self {
            JobType::Upload => "upload",
            JobType::Inference => "neural",
        }
    }

    /// Whether a finished job of this type exposes a result reference.
    pub fn has_result(&self) -> bool {
        matches!(self, JobType::Inference)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Upload => write!(f, "upload"),
            JobType::Inference => write!(f, "inference"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// A backend job as tracked locally by the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<ResultRef>,
}

impl Job {
    pub fn pending(id: JobId, job_type: JobType) -> Self {
        Self {
            id,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            result: None,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// One file currently held in the backend staging area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagedFile {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FileListing {
    #[serde(default)]
    pub files: Vec<StagedFile>,
}

/// A local file selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Lowercased extension after the last dot, if any.
    pub fn extension(&self) -> Option<String> {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// Binary content of a downloaded result file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedResult {
    pub file_id: ResultRef,
    pub bytes: Vec<u8>,
}
