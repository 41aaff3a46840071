// Scripted backend for orchestrator tests - no network, deterministic
// responses, every call recorded.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::errors::BackendError;
use super::traits::{JobClient, StagingBackend, WorkflowBackend};
use super::types::{DownloadedResult, JobId, JobType, ResultRef, StagedFile, UploadFile};

#[derive(Debug, Default)]
struct Script {
    next_job: u32,
    create_responses: VecDeque<Result<JobId, BackendError>>,
    progress: HashMap<JobId, VecDeque<Result<u8, BackendError>>>,
    last_progress: HashMap<JobId, u8>,
    result: Option<Result<ResultRef, BackendError>>,
    validate: Option<Result<String, BackendError>>,
    download: Option<Result<Vec<u8>, BackendError>>,
    upload_error: Option<BackendError>,
    cleanup_error: Option<BackendError>,
    list_error: Option<BackendError>,
    files: Vec<StagedFile>,

    created: Vec<(JobId, JobType)>,
    result_calls: Vec<JobId>,
    cancelled: Vec<JobId>,
    uploads: Vec<(Option<JobId>, Vec<String>)>,
    cleanups: u32,
}

/// In-memory backend whose answers are queued up by the test.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }

    pub fn queue_create(&self, response: Result<JobId, BackendError>) {
        self.with(|s| s.create_responses.push_back(response));
    }

    /// Queue progress answers for a job. Once drained the last
    /// successful value is repeated.
    pub fn queue_progress(&self, id: &str, responses: Vec<Result<u8, BackendError>>) {
        self.with(|s| {
            s.progress
                .entry(JobId::new(id))
                .or_default()
                .extend(responses)
        });
    }

    pub fn set_result(&self, response: Result<ResultRef, BackendError>) {
        self.with(|s| s.result = Some(response));
    }

    pub fn set_validate(&self, response: Result<String, BackendError>) {
        self.with(|s| s.validate = Some(response));
    }

    pub fn set_download(&self, response: Result<Vec<u8>, BackendError>) {
        self.with(|s| s.download = Some(response));
    }

    pub fn fail_uploads(&self, error: BackendError) {
        self.with(|s| s.upload_error = Some(error));
    }

    pub fn fail_cleanup(&self, error: BackendError) {
        self.with(|s| s.cleanup_error = Some(error));
    }

    pub fn fail_listing(&self, error: Option<BackendError>) {
        self.with(|s| s.list_error = error);
    }

    pub fn stage_files(&self, names: &[&str]) {
        self.with(|s| {
            s.files.extend(names.iter().map(|n| StagedFile { name: n.to_string() }))
        });
    }

    pub fn created_jobs(&self) -> Vec<(JobId, JobType)> {
        self.with(|s| s.created.clone())
    }

    pub fn result_calls(&self) -> Vec<JobId> {
        self.with(|s| s.result_calls.clone())
    }

    pub fn cancelled_jobs(&self) -> Vec<JobId> {
        self.with(|s| s.cancelled.clone())
    }

    pub fn uploads(&self) -> Vec<(Option<JobId>, Vec<String>)> {
        self.with(|s| s.uploads.clone())
    }

    pub fn cleanup_calls(&self) -> u32 {
        self.with(|s| s.cleanups)
    }

    pub fn staged_count(&self) -> usize {
        self.with(|s| s.files.len())
    }
}

#[async_trait]
impl JobClient for ScriptedBackend {
    async fn create_job(&self, job_type: JobType) -> Result<JobId, BackendError> {
        self.with(|s| {
            let response = s.create_responses.pop_front().unwrap_or_else(|| {
                s.next_job += 1;
                Ok(JobId::new(format!("job-{}", s.next_job)))
            });
            if let Ok(id) = &response {
                s.created.push((id.clone(), job_type));
            }
            response
        })
    }

    async fn get_progress(&self, id: &JobId) -> Result<u8, BackendError> {
        self.with(|s| {
            let next = s.progress.get_mut(id).and_then(|queue| queue.pop_front());
            match next {
                Some(Ok(value)) => {
                    s.last_progress.insert(id.clone(), value);
                    Ok(value)
                }
                Some(Err(e)) => Err(e),
                None => Ok(s.last_progress.get(id).copied().unwrap_or(0)),
            }
        })
    }

    async fn get_result(&self, id: &JobId) -> Result<ResultRef, BackendError> {
        self.with(|s| {
            s.result_calls.push(id.clone());
            s.result
                .clone()
                .unwrap_or_else(|| Ok(ResultRef::new(format!("result-{id}"))))
        })
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        self.with(|s| s.cancelled.push(id.clone()));
        Ok(())
    }
}

#[async_trait]
impl StagingBackend for ScriptedBackend {
    async fn list_files(&self) -> Result<Vec<StagedFile>, BackendError> {
        self.with(|s| match &s.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.files.clone()),
        })
    }

    async fn upload_files(
        &self,
        thread_id: Option<JobId>,
        files: Vec<UploadFile>,
    ) -> Result<(), BackendError> {
        self.with(|s| {
            let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
            s.uploads.push((thread_id.clone(), names.clone()));
            if let Some(e) = &s.upload_error {
                return Err(e.clone());
            }
            if let Some(id) = thread_id {
                s.last_progress.insert(id, 100);
            }
            s.files.extend(names.into_iter().map(|name| StagedFile { name }));
            Ok(())
        })
    }

    async fn cleanup(&self) -> Result<(), BackendError> {
        self.with(|s| {
            s.cleanups += 1;
            if let Some(e) = &s.cleanup_error {
                return Err(e.clone());
            }
            s.files.clear();
            Ok(())
        })
    }
}

#[async_trait]
impl WorkflowBackend for ScriptedBackend {
    async fn validate(&self) -> Result<String, BackendError> {
        self.with(|s| {
            s.validate
                .clone()
                .unwrap_or_else(|| Ok("Files validated".to_string()))
        })
    }

    async fn download(&self, file_id: &ResultRef) -> Result<DownloadedResult, BackendError> {
        self.with(|s| {
            let bytes = s.download.clone().unwrap_or_else(|| Ok(b"DICM".to_vec()))?;
            Ok(DownloadedResult {
                file_id: file_id.clone(),
                bytes,
            })
        })
    }
}
