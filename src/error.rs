//! # Error Handling
//!
//! Custom error types and their conversion into HTTP responses.
//!
//! ## Error taxonomy:
//! - **InvalidUpload**: the client sent something that is not an audio upload (400)
//! - **Transcription**: staging, model invocation or result mapping failed (500)
//! - **Internal**: any other server-side failure (500)
//!
//! Only `InvalidUpload` is the client's fault; everything that happens after an
//! upload passes validation is reported as a server error.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::InvalidUpload("missing 'file' field".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Upload rejected before any bytes were read
    InvalidUpload(String),

    /// Failure while staging, transcribing or mapping an accepted upload
    Transcription(String),

    /// Internal server errors not tied to a transcription
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidUpload(msg) => write!(f, "Invalid upload: {}", msg),
            AppError::Transcription(msg) => write!(f, "Failed to transcribe audio: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in the JSON body.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::InvalidUpload(_) => "invalid_upload",
            AppError::Transcription(_) => "transcription_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "invalid_upload",
///     "message": "Invalid upload: file must be audio (audio/* or application/octet-stream)",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            AppError::Transcription(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Any `anyhow` error reaching a handler is a server-side failure.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::InvalidUpload("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Transcription("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transcription_message_keeps_cause() {
        let err = AppError::Transcription("decoder exploded".into());
        assert_eq!(err.to_string(), "Failed to transcribe audio: decoder exploded");
    }

    #[test]
    fn test_error_response_body() {
        let response = AppError::InvalidUpload("bad type".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().try_into_bytes().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "invalid_upload");
        assert_eq!(body["error"]["message"], "Invalid upload: bad type");
        assert!(body["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: AppError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, AppError::Internal(ref m) if m == "boom"));
    }
}
