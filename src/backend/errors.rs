use thiserror::Error;

/// Failures surfaced by the backend boundary.
///
/// Variants carry plain strings so errors can travel through poller
/// events and be compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached (connect failure, timeout, reset).
    #[error("Backend unreachable: {0}")]
    Connection(String),

    /// The backend answered with a non-success status.
    #[error("Backend error ({status}): {body}")]
    Server { status: u16, body: String },

    /// The job id (or other resource) is unknown or has expired.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A result was requested before the job finished.
    #[error("Result not ready for job {0}")]
    NotReady(String),

    /// The backend (or a local pre-check) rejected the input.
    #[error("Validation failed: {0}")]
    Validation(String),
}

impl BackendError {
    /// Errors worth retrying on the next poll tick.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Connection(_) => true,
            BackendError::Server { status, .. } => *status >= 500,
            BackendError::NotFound(_) | BackendError::NotReady(_) | BackendError::Validation(_) => {
                false
            }
        }
    }

    /// Short machine-friendly name used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Connection(_) => "connection",
            BackendError::Server { .. } => "server",
            BackendError::NotFound(_) => "not_found",
            BackendError::NotReady(_) => "not_ready",
            BackendError::Validation(_) => "validation",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return BackendError::Server {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return BackendError::Server {
                status: 200,
                body: format!("malformed response body: {err}"),
            };
        }
        BackendError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_and_5xx_are_transient() {
        assert!(BackendError::Connection("refused".into()).is_transient());
        assert!(BackendError::Server { status: 503, body: String::new() }.is_transient());
    }

    #[test]
    fn test_client_side_failures_are_not_transient() {
        assert!(!BackendError::Server { status: 400, body: String::new() }.is_transient());
        assert!(!BackendError::NotFound("abc".into()).is_transient());
        assert!(!BackendError::NotReady("abc".into()).is_transient());
        assert!(!BackendError::Validation("empty".into()).is_transient());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = BackendError::Server { status: 500, body: "boom".into() };
        assert_eq!(err.to_string(), "Backend error (500): boom");
        assert_eq!(err.kind(), "server");
    }
}
