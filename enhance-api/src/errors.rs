use crate::api::models::enhance::ErrorBody;
use crate::inference::EnhanceError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

/// Message returned for uploads outside the extension allow-list. Clients match on it verbatim.
pub const UNSUPPORTED_FILE_TYPE: &str = "Unsupported file type";

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Upload extension is not one of .jpg, .jpeg, .png
    #[error("Unsupported file type: {extension:?}")]
    UnsupportedFileType {
        extension: Option<String>,
        /// Report with 415 rather than 200
        as_client_error: bool,
    },

    /// Upload exceeds the configured size limit
    #[error("{message}")]
    PayloadTooLarge { message: String },

    /// Enhancement capacity exhausted
    #[error("{message}")]
    TooManyRequests { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Model or image processing error
    #[error(transparent)]
    Enhance(#[from] EnhanceError),

    /// Filesystem error while staging or reading temp files
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::UnsupportedFileType { as_client_error, .. } => {
                if *as_client_error {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                } else {
                    StatusCode::OK
                }
            }
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Enhance(EnhanceError::Decode(_)) => StatusCode::BAD_REQUEST,
            Error::Internal { .. } | Error::Enhance(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } | Error::PayloadTooLarge { message } | Error::TooManyRequests { message } => message.clone(),
            Error::UnsupportedFileType { .. } => UNSUPPORTED_FILE_TYPE.to_string(),
            Error::Enhance(EnhanceError::Decode(_)) => "Uploaded file is not a valid image".to_string(),
            Error::Internal { .. } | Error::Enhance(_) | Error::Io(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Enhance(EnhanceError::Decode(_)) | Error::BadRequest { .. } | Error::UnsupportedFileType { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::PayloadTooLarge { .. } | Error::TooManyRequests { .. } => {
                tracing::info!("Request rejected: {}", self);
            }
            Error::Internal { .. } | Error::Enhance(_) | Error::Io(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
        }

        let status = self.status_code();
        (status, Json(ErrorBody { error: self.user_message() })).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_file_type_defaults_to_ok() {
        let err = Error::UnsupportedFileType {
            extension: Some(".gif".to_string()),
            as_client_error: false,
        };
        assert_eq!(err.status_code(), StatusCode::OK);
        assert_eq!(err.user_message(), "Unsupported file type");
    }

    #[test]
    fn test_unsupported_file_type_as_client_error() {
        let err = Error::UnsupportedFileType {
            extension: None,
            as_client_error: true,
        };
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn test_decode_failure_is_client_error() {
        let err = Error::from(EnhanceError::Decode("bad header".to_string()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.user_message().contains("bad header"));
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let errors = [
            Error::from(EnhanceError::Inference("cuda oom".to_string())),
            Error::from(std::io::Error::other("disk full")),
            Error::Internal {
                operation: "read /srv/models/BSRGAN.onnx".to_string(),
            },
        ];
        for err in errors {
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(err.user_message(), "Internal server error");
        }
    }
}
