//! HTTP backend tests against a mocked segmentation service
//!
//! wiremock stands in for the Flask-style API so request shapes and
//! status-code mapping can be checked without a live backend.

use std::time::Duration;

use autoseg::{
    BackendError, HttpBackend, JobClient, JobId, JobType, ResultRef, StagingBackend, UploadFile,
    WorkflowBackend,
};
use serde_json::json;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Segmentation API mock server
pub struct SegmentationApiMock {
    pub server: MockServer,
}

impl SegmentationApiMock {
    pub async fn new() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn backend(&self) -> HttpBackend {
        HttpBackend::new(format!("{}/api", self.server.uri()), Duration::from_secs(5)).unwrap()
    }

    pub async fn respond(&self, verb: &str, route: &str, response: ResponseTemplate) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }
}

#[tokio::test]
async fn test_create_job_uses_thread_type() {
    let api = SegmentationApiMock::new().await;
    Mock::given(method("GET"))
        .and(path("/api/threads/create"))
        .and(query_param("threadtype", "neural"))
        .respond_with(ResponseTemplate::new(200).set_body_string("\"abc123\"\n"))
        .expect(1)
        .mount(&api.server)
        .await;

    let id = api.backend().create_job(JobType::Inference).await.unwrap();
    assert_eq!(id, JobId::new("abc123"));
}

#[tokio::test]
async fn test_progress_is_parsed_from_text() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "GET",
        "/api/threads/abc123/progress",
        ResponseTemplate::new(200).set_body_string("45"),
    )
    .await;

    let progress = api.backend().get_progress(&JobId::new("abc123")).await.unwrap();
    assert_eq!(progress, 45);
}

#[tokio::test]
async fn test_unknown_job_maps_to_not_found() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "GET",
        "/api/threads/expired/progress",
        ResponseTemplate::new(404).set_body_string("no such thread"),
    )
    .await;

    let err = api
        .backend()
        .get_progress(&JobId::new("expired"))
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::NotFound("expired".into()));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "GET",
        "/api/threads/abc123/progress",
        ResponseTemplate::new(503).set_body_string("overloaded"),
    )
    .await;

    let err = api
        .backend()
        .get_progress(&JobId::new("abc123"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BackendError::Server {
            status: 503,
            body: "overloaded".into()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_result_before_completion_is_not_ready() {
    let api = SegmentationApiMock::new().await;
    Mock::given(method("GET"))
        .and(path("/api/inference"))
        .and(query_param("thread_id", "abc123"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&api.server)
        .await;

    let err = api
        .backend()
        .get_result(&JobId::new("abc123"))
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::NotReady("abc123".into()));
}

#[tokio::test]
async fn test_result_reference_is_returned() {
    let api = SegmentationApiMock::new().await;
    Mock::given(method("GET"))
        .and(path("/api/inference"))
        .and(query_param("thread_id", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("file42"))
        .mount(&api.server)
        .await;

    let result = api.backend().get_result(&JobId::new("abc123")).await.unwrap();
    assert_eq!(result, ResultRef::new("file42"));
}

#[tokio::test]
async fn test_cancel_job_sends_delete() {
    let api = SegmentationApiMock::new().await;
    Mock::given(method("DELETE"))
        .and(path("/api/threads/abc123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&api.server)
        .await;

    api.backend().cancel_job(&JobId::new("abc123")).await.unwrap();
}

#[tokio::test]
async fn test_list_files_reads_json_listing() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "GET",
        "/api/files",
        ResponseTemplate::new(200).set_body_json(json!({"files": ["ct_001.dcm", "ct_002.dcm"]})),
    )
    .await;

    let files = api.backend().list_files().await.unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["ct_001.dcm", "ct_002.dcm"]);
}

#[tokio::test]
async fn test_upload_posts_multipart_with_thread_id() {
    let api = SegmentationApiMock::new().await;
    Mock::given(method("POST"))
        .and(path("/api/files"))
        .and(query_param("thread_id", "job-7"))
        .and(header_exists("content-type"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&api.server)
        .await;

    api.backend()
        .upload_files(
            Some(JobId::new("job-7")),
            vec![UploadFile::new("ct_001.dcm", b"DICM".to_vec())],
        )
        .await
        .unwrap();

    let requests = api.server.received_requests().await.unwrap();
    let content_type = requests[0]
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("multipart/form-data"));
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("filename=\"ct_001.dcm\""));
}

#[tokio::test]
async fn test_rejected_upload_maps_to_validation() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "POST",
        "/api/files",
        ResponseTemplate::new(400).set_body_string("unsupported file type"),
    )
    .await;

    let err = api
        .backend()
        .upload_files(None, vec![UploadFile::new("notes.dcm", b"x".to_vec())])
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::Validation("unsupported file type".into()));
}

#[tokio::test]
async fn test_cleanup_failure_is_server_error() {
    let api = SegmentationApiMock::new().await;
    api.respond("DELETE", "/api/cleanup", ResponseTemplate::new(500)).await;

    let err = api.backend().cleanup().await.unwrap_err();
    assert!(matches!(err, BackendError::Server { status: 500, .. }));
}

#[tokio::test]
async fn test_validate_returns_trimmed_status_text() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "GET",
        "/api/files/validate",
        ResponseTemplate::new(200).set_body_string("  12 files validated\n"),
    )
    .await;

    let message = api.backend().validate().await.unwrap();
    assert_eq!(message, "12 files validated");
}

#[tokio::test]
async fn test_validate_rejection_maps_to_validation() {
    let api = SegmentationApiMock::new().await;
    api.respond(
        "GET",
        "/api/files/validate",
        ResponseTemplate::new(422).set_body_string("no DICOM files staged"),
    )
    .await;

    let err = api.backend().validate().await.unwrap_err();
    assert_eq!(err, BackendError::Validation("no DICOM files staged".into()));
}

#[tokio::test]
async fn test_download_returns_bytes() {
    let api = SegmentationApiMock::new().await;
    Mock::given(method("GET"))
        .and(path("/api/files/download"))
        .and(query_param("file_id", "file42"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"DICM\x00\x01".to_vec()))
        .mount(&api.server)
        .await;

    let result = api.backend().download(&ResultRef::new("file42")).await.unwrap();
    assert_eq!(result.file_id, ResultRef::new("file42"));
    assert_eq!(result.bytes, b"DICM\x00\x01".to_vec());
}

#[tokio::test]
async fn test_unreachable_backend_is_connection_error() {
    let backend = HttpBackend::new("http://127.0.0.1:1/api", Duration::from_secs(2)).unwrap();

    let err = backend.create_job(JobType::Upload).await.unwrap_err();
    assert!(matches!(err, BackendError::Connection(_)));
    assert!(err.is_transient());
}
