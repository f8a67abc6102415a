//! Error kinds shared across the API and the pipeline worker.
//!
//! Each variant maps to one error kind in the public contract. The
//! orchestrator uses `is_retryable` to decide between broker retry and a
//! terminal FAILED commit; the API maps kinds onto HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors raised by validation, persistence, the queue, and pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("file exceeds size cap: {size} > {cap} bytes")]
    TooLarge { size: u64, cap: u64 },

    #[error("not a valid PDF: {0}")]
    InvalidPdf(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("illegal state transition: {0}")]
    Conflict(String),

    #[error("results not ready: document is {0}")]
    NotReady(String),

    #[error("processing failed: {0}")]
    Failed(String),

    #[error("upstream dependency error: {0}")]
    Upstream(String),

    #[error("stage {stage} timed out after {seconds}s")]
    StageTimeout { stage: &'static str, seconds: u64 },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("PDF contains no pages")]
    EmptyPdf,

    #[error("PDF is password protected")]
    PasswordProtected,

    #[error("no readable pages in PDF")]
    UnreadablePages,

    #[error("processing cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable kind tag surfaced in API bodies and persisted on FAILED rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::TooLarge { .. } => "too_large_error",
            Self::InvalidPdf(_) => "invalid_pdf_error",
            Self::NotFound(_) => "not_found_error",
            Self::Conflict(_) => "conflict_error",
            Self::NotReady(_) => "not_ready_error",
            Self::Failed(_) => "failed_error",
            Self::Upstream(_) => "upstream_error",
            Self::StageTimeout { .. } => "stage_timeout_error",
            Self::InsufficientData(_) => "insufficient_data_error",
            Self::EmptyPdf => "empty_pdf_error",
            Self::PasswordProtected => "password_protected_error",
            Self::UnreadablePages => "unreadable_page_error",
            Self::Cancelled => "cancelled_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the broker should redeliver the job after this error.
    ///
    /// Deterministic data errors re-fail identically on every attempt, so
    /// they go straight to a terminal FAILED commit.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(_) | Self::StageTimeout { .. } | Self::Internal(_) => true,
            Self::Validation(_)
            | Self::TooLarge { .. }
            | Self::InvalidPdf(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::NotReady(_)
            | Self::Failed(_)
            | Self::InsufficientData(_)
            | Self::EmptyPdf
            | Self::PasswordProtected
            | Self::UnreadablePages
            | Self::Cancelled => false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidPdf(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::NotReady(_) | Self::Failed(_) => StatusCode::CONFLICT,
            Self::Cancelled => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::StageTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::EmptyPdf | Self::PasswordProtected | Self::UnreadablePages => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::InsufficientData(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Upstream(format!("database: {e}"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Upstream(format!("io: {e}"))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Upstream(format!("http: {e}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}

impl IntoResponse for PipelineError {
    /// API error body. Stack traces never cross this boundary.
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error_kind": self.kind(),
            "message": self.to_string(),
            "request_id": uuid::Uuid::new_v4().to_string(),
        });
        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, Self::NotReady(_)) {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("5"));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Upstream("ocr down".into()).is_retryable());
        assert!(PipelineError::StageTimeout { stage: "extract", seconds: 180 }.is_retryable());
        assert!(PipelineError::Internal("panic".into()).is_retryable());

        assert!(!PipelineError::EmptyPdf.is_retryable());
        assert!(!PipelineError::PasswordProtected.is_retryable());
        assert!(!PipelineError::InsufficientData("no area".into()).is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PipelineError::TooLarge { size: 1, cap: 0 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            PipelineError::InvalidPdf("bad magic".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            PipelineError::NotReady("pending".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(PipelineError::Cancelled.kind(), "cancelled_error");
        assert_eq!(PipelineError::EmptyPdf.kind(), "empty_pdf_error");
    }
}
