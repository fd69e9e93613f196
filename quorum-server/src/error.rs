//! Error taxonomy for the API surface and the storage layer.
//!
//! `StoreError` covers persistence failures and is deliberately coarse:
//! callers cannot meaningfully recover from a broken database beyond
//! surfacing a 500 and letting the client retry (idempotency makes that
//! safe). `ApiError` is the user-visible taxonomy; conflicts are terminal
//! and never retried internally.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// Storage-layer error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// Persisted data could not be interpreted.
    #[error("corrupt {what} in database")]
    Corruption { what: &'static str },
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        StoreError::Corruption { what }
    }
}

/// User-visible API error.
///
/// Maps onto HTTP status codes in `IntoResponse`. The body shape is
/// `{"message": ..., "detail": ...}` for every variant.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Conflict {
        message: &'static str,
        detail: String,
    },

    #[error("{message}")]
    NotFound {
        message: &'static str,
        detail: String,
    },

    #[error("{message}")]
    Forbidden {
        message: &'static str,
        detail: String,
    },

    #[error("{message}")]
    Unauthorized {
        message: &'static str,
        detail: String,
    },

    #[error("{message}")]
    Validation {
        message: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Infrastructure(#[from] StoreError),
}

impl ApiError {
    pub fn conflict(message: &'static str, detail: impl Into<String>) -> Self {
        ApiError::Conflict {
            message,
            detail: detail.into(),
        }
    }

    pub fn not_found(message: &'static str, detail: impl Into<String>) -> Self {
        ApiError::NotFound {
            message,
            detail: detail.into(),
        }
    }

    pub fn forbidden(message: &'static str, detail: impl Into<String>) -> Self {
        ApiError::Forbidden {
            message,
            detail: detail.into(),
        }
    }

    pub fn unauthorized(message: &'static str, detail: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            message,
            detail: detail.into(),
        }
    }

    pub fn validation(message: &'static str, detail: impl Into<String>) -> Self {
        ApiError::Validation {
            message,
            detail: detail.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (message, detail) = match &self {
            ApiError::Conflict { message, detail }
            | ApiError::NotFound { message, detail }
            | ApiError::Forbidden { message, detail }
            | ApiError::Unauthorized { message, detail }
            | ApiError::Validation { message, detail } => (*message, detail.clone()),
            ApiError::Infrastructure(e) => {
                // Internal details stay in the log, not the response body.
                error!("infrastructure error: {}", e);
                (
                    "Internal server error",
                    "The request could not be processed; retrying is safe".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "message": message,
                "detail": detail,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::conflict("x", "y").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::not_found("x", "y").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::validation("x", "y").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Infrastructure(StoreError::corruption("row")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_error_display() {
        let e = StoreError::storage("get", "disk on fire");
        assert_eq!(e.to_string(), "storage error during get: disk on fire");

        let e = StoreError::corruption("proposal row");
        assert_eq!(e.to_string(), "corrupt proposal row in database");
    }
}
