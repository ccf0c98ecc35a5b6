use crate::services::dispatcher::DispatchError;
use crate::services::operations::OperationError;
use crate::services::staging::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Stable, machine readable failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum ErrorKind {
    NotFound,
    MissingFile,
    MultipleFiles,
    TooLarge,
    MalformedRequest,
    UnsupportedFormat,
    Timeout,
    #[serde(rename = "IOFailure")]
    IoFailure,
    OperationError,
    ClientDisconnected,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MissingFile
            | ErrorKind::MultipleFiles
            | ErrorKind::TooLarge
            | ErrorKind::MalformedRequest => StatusCode::BAD_REQUEST,
            ErrorKind::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::IoFailure | ErrorKind::OperationError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // nginx's "client closed request"; nobody is usually left to read it
            ErrorKind::ClientDisconnected => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Always "error"
    pub status: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-side detail, logged and never sent to the client
    detail: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    fn internal(kind: ErrorKind, message: &str, detail: impl ToString) -> Self {
        Self {
            kind,
            message: message.to_string(),
            detail: Some(detail.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::TooLarge => ApiError::new(ErrorKind::TooLarge, err.to_string()),
            UploadError::MissingFile => ApiError::new(ErrorKind::MissingFile, err.to_string()),
            UploadError::MultipleFiles => {
                ApiError::new(ErrorKind::MultipleFiles, err.to_string())
            }
            UploadError::Malformed(_) => {
                ApiError::new(ErrorKind::MalformedRequest, err.to_string())
            }
            UploadError::ClientDisconnected => {
                ApiError::new(ErrorKind::ClientDisconnected, err.to_string())
            }
            UploadError::Io(e) => ApiError::internal(
                ErrorKind::IoFailure,
                "Failed to store the uploaded file",
                e,
            ),
        }
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::UnsupportedFormat(msg) => {
                ApiError::new(ErrorKind::UnsupportedFormat, msg)
            }
            OperationError::InvalidInput(msg) => ApiError::new(ErrorKind::MalformedRequest, msg),
            OperationError::Failed(msg) => ApiError::new(ErrorKind::OperationError, msg),
            OperationError::Internal(detail) => {
                ApiError::internal(ErrorKind::OperationError, "Internal Server Error", detail)
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(e) => ApiError::new(ErrorKind::NotFound, e.to_string()),
            DispatchError::Upload(e) => e.into(),
            DispatchError::Operation(e) => e.into(),
            DispatchError::Timeout(limit) => ApiError::internal(
                ErrorKind::Timeout,
                "Operation timed out",
                format!("exceeded {:?}", limit),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(
                kind = ?self.kind,
                detail = self.detail.as_deref().unwrap_or(""),
                "Request failed: {}",
                self.message
            );
        } else {
            tracing::debug!(kind = ?self.kind, "Request rejected: {}", self.message);
        }

        let body = Json(ErrorResponse {
            status: "error".to_string(),
            kind: self.kind,
            message: self.message,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::registry::NotFound;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::MissingFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::MultipleFiles.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::TooLarge.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::IoFailure.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ErrorKind::OperationError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ErrorKind::ClientDisconnected.status().as_u16(), 499);
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_value(ErrorKind::IoFailure).unwrap(),
            "IOFailure"
        );
        assert_eq!(
            serde_json::to_value(ErrorKind::MultipleFiles).unwrap(),
            "MultipleFiles"
        );
    }

    #[test]
    fn test_internal_details_are_not_exposed() {
        let io = std::io::Error::other("disk full at /var/tmp/doc-ops/upload-abc.pdf");
        let err = ApiError::from(DispatchError::from(UploadError::Io(io)));
        assert_eq!(err.kind, ErrorKind::IoFailure);
        assert!(!err.message.contains("/var/tmp"));

        let err = ApiError::from(DispatchError::from(OperationError::Internal(
            "lopdf failed reading /tmp/x".to_string(),
        )));
        assert_eq!(err.kind, ErrorKind::OperationError);
        assert_eq!(err.message, "Internal Server Error");
    }

    #[test]
    fn test_not_found_message() {
        let err = ApiError::from(DispatchError::from(NotFound("unknown".to_string())));
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "Operation 'unknown' not found");
    }
}
