//! Error types for the runbox server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use runbox_core::{ConfigError, RuntimeError};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur in the runbox server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Requested language is not in the language table
    #[error("language not supported")]
    UnsupportedLanguage,

    /// Language named on the command line is not configured
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),

    /// Language table could not be loaded
    #[error(transparent)]
    LanguageTable(#[from] ConfigError),

    /// Container runtime failure outside of a session
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a new configuration error.
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::UnsupportedLanguage | ServerError::UnknownLanguage(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Runtime(_) => StatusCode::BAD_GATEWAY,
            ServerError::LanguageTable(_)
            | ServerError::Config(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Plain-text body, as expected by websocket clients probing the endpoints.
impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
