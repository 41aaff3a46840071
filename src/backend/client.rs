//! HTTP implementation of the backend traits.
//!
//! Wraps the segmentation service's REST endpoints (job threads, staging,
//! validation, inference results) using [`reqwest`]. Non-2xx responses are
//! mapped onto [`BackendError`] according to which endpoint produced them.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::errors::BackendError;
use super::traits::{JobClient, StagingBackend, WorkflowBackend};
use super::types::{
    DownloadedResult, FileListing, JobId, JobType, ResultRef, StagedFile, UploadFile,
};
use crate::observability::backend_metrics;

/// How a failed status code should be interpreted.
#[derive(Debug, Clone, Copy)]
enum StatusContext<'a> {
    /// The request addressed a specific job.
    Job(&'a JobId),
    /// The request carried user input the backend may reject.
    Input,
    Plain,
}

/// HTTP client for a single backend instance.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a client for `base_url`, e.g. `http://localhost:5000/api`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        backend_metrics().record_request();
        request.send().await.map_err(|e| {
            backend_metrics().record_error();
            BackendError::from(e)
        })
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or the mapped error.
    async fn ensure_success(
        response: reqwest::Response,
        context: StatusContext<'_>,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        backend_metrics().record_error();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(map_status(status, body, context))
    }

    async fn read_text(
        response: reqwest::Response,
        context: StatusContext<'_>,
    ) -> Result<String, BackendError> {
        let response = Self::ensure_success(response, context).await?;
        Ok(response.text().await?)
    }
}

fn map_status(status: StatusCode, body: String, context: StatusContext<'_>) -> BackendError {
    match (context, status) {
        (StatusContext::Job(id), StatusCode::NOT_FOUND) => BackendError::NotFound(id.to_string()),
        (_, StatusCode::NOT_FOUND) => BackendError::NotFound(body),
        // 425 Too Early
        (StatusContext::Job(id), s) if s == StatusCode::CONFLICT || s.as_u16() == 425 => {
            BackendError::NotReady(id.to_string())
        }
        (StatusContext::Input, s) if s.is_client_error() => BackendError::Validation(body),
        (_, s) => BackendError::Server {
            status: s.as_u16(),
            body,
        },
    }
}

/// Strip whitespace and JSON string quoting from a plain-text id.
fn parse_handle(raw: &str, what: &str) -> Result<String, BackendError> {
    let handle = raw.trim().trim_matches('"').trim();
    if handle.is_empty() {
        return Err(BackendError::Server {
            status: 200,
            body: format!("empty {what} in response"),
        });
    }
    Ok(handle.to_string())
}

fn parse_progress(raw: &str) -> Result<u8, BackendError> {
    let value: f64 = raw.trim().parse().map_err(|_| BackendError::Server {
        status: 200,
        body: format!("malformed progress value: {raw:?}"),
    })?;
    if !(0.0..=100.0).contains(&value) {
        return Err(BackendError::Server {
            status: 200,
            body: format!("progress out of range: {value}"),
        });
    }
    Ok(value.round() as u8)
}

#[async_trait]
impl JobClient for HttpBackend {
    async fn create_job(&self, job_type: JobType) -> Result<JobId, BackendError> {
        let request = self
            .client
            .get(self.url("/threads/create"))
            .query(&[("threadtype", job_type.thread_type())]);
        let response = self.send(request).await?;
        let body = Self::read_text(response, StatusContext::Plain).await?;
        let id = JobId::new(parse_handle(&body, "job id")?);
        debug!(job_id = %id, job_type = %job_type, "Created backend job");
        Ok(id)
    }

    async fn get_progress(&self, id: &JobId) -> Result<u8, BackendError> {
        let request = self
            .client
            .get(self.url(&format!("/threads/{}/progress", id)));
        let response = self.send(request).await?;
        let body = Self::read_text(response, StatusContext::Job(id)).await?;
        parse_progress(&body)
    }

    async fn get_result(&self, id: &JobId) -> Result<ResultRef, BackendError> {
        let request = self
            .client
            .get(self.url("/inference"))
            .query(&[("thread_id", id.as_str())]);
        let response = self.send(request).await?;
        let body = Self::read_text(response, StatusContext::Job(id)).await?;
        Ok(ResultRef::new(parse_handle(&body, "result file id")?))
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        let request = self.client.delete(self.url(&format!("/threads/{}", id)));
        let response = self.send(request).await?;
        Self::ensure_success(response, StatusContext::Job(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl StagingBackend for HttpBackend {
    async fn list_files(&self) -> Result<Vec<StagedFile>, BackendError> {
        let request = self
            .client
            .get(self.url("/files"))
            .header(reqwest::header::ACCEPT, "application/json");
        let response = self.send(request).await?;
        let response = Self::ensure_success(response, StatusContext::Plain).await?;
        let listing: FileListing = response.json().await?;
        Ok(listing.files)
    }

    async fn upload_files(
        &self,
        thread_id: Option<JobId>,
        files: Vec<UploadFile>,
    ) -> Result<(), BackendError> {
        let form = files
            .into_iter()
            .enumerate()
            .fold(Form::new(), |form, (index, file)| {
                form.part(index.to_string(), Part::bytes(file.bytes).file_name(file.name))
            });

        let mut request = self.client.post(self.url("/files")).multipart(form);
        if let Some(id) = &thread_id {
            request = request.query(&[("thread_id", id.as_str())]);
        }
        let response = self.send(request).await?;
        Self::ensure_success(response, StatusContext::Input).await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), BackendError> {
        let request = self.client.delete(self.url("/cleanup"));
        let response = self.send(request).await?;
        Self::ensure_success(response, StatusContext::Plain).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowBackend for HttpBackend {
    async fn validate(&self) -> Result<String, BackendError> {
        let request = self.client.get(self.url("/files/validate"));
        let response = self.send(request).await?;
        let body = Self::read_text(response, StatusContext::Input).await?;
        Ok(body.trim().to_string())
    }

    async fn download(&self, file_id: &ResultRef) -> Result<DownloadedResult, BackendError> {
        let request = self
            .client
            .get(self.url("/files/download"))
            .query(&[("file_id", file_id.as_str())]);
        let response = self.send(request).await?;
        let response = Self::ensure_success(response, StatusContext::Plain).await?;
        let bytes = response.bytes().await?;
        Ok(DownloadedResult {
            file_id: file_id.clone(),
            bytes: bytes.to_vec(),
        })
    }
}
