//! Error types for the bankgreen catalog

use thiserror::Error;

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite failure (wraps rusqlite::Error)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV input during import
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings could not be loaded or validated
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Attempt to edit a field the admin exposes as read-only
    #[error("Field is read-only: {0}")]
    ReadOnlyField(String),

    /// Uniqueness rule violated (duplicate tag, brand already linked for a source)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

#[cfg(feature = "server")]
mod response {
    use super::Error;
    use axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
        Json,
    };

    impl Error {
        pub fn status_code(&self) -> StatusCode {
            match self {
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::InvalidInput(_) | Error::Csv(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
                Error::ReadOnlyField(_) => StatusCode::FORBIDDEN,
                Error::Conflict(_) => StatusCode::CONFLICT,
                Error::Unauthorized => StatusCode::UNAUTHORIZED,
                Error::Database(_) | Error::Io(_) | Error::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
    }

    impl IntoResponse for Error {
        fn into_response(self) -> Response {
            let status = self.status_code();
            if status.is_server_error() {
                tracing::error!(error = %self, "request failed");
            } else {
                tracing::debug!(error = %self, "request rejected");
            }

            let body = serde_json::json!({
                "success": false,
                "data": null,
                "error": self.to_string(),
            });
            (status, Json(body)).into_response()
        }
    }
}
