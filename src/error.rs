//! Error Handling Module
//!
//! A single error type is shared by the relay, the streaming layer and the
//! upstream generators. Variants carry plain strings so errors stay `Clone`
//! and can travel through switch events and channels.
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::error::RelayError;
//!
//! let error = RelayError::api_error(503, "overloaded");
//! assert!(error.is_retryable());
//! assert_eq!(error.status_code().as_u16(), 500);
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Message returned to clients for every non-validation failure.
pub const MASKED_ERROR_MESSAGE: &str = "Internal Server Error";

/// Errors produced while relaying a chat request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed or unsupported request input (400)
    #[error("{0}")]
    BadRequest(String),

    /// The upstream provider call could not be started
    #[error("Upstream invocation failed: {0}")]
    UpstreamInvocation(String),

    /// Transport-level HTTP failure talking to the upstream
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Upstream answered with a non-success status
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    /// Failure while reading an upstream stream
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Upstream payload could not be decoded
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A segment or invocation exceeded its deadline
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Programming error: operation on a stream in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid relay configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RelayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// HTTP status the relay answers with when this error ends a request.
    ///
    /// Only validation failures are visible to the client; everything else
    /// collapses into a generic 500.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether an upstream call failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(_) | Self::TimeoutError(_) => true,
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            _ => MASKED_ERROR_MESSAGE.to_string(),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimeoutError(err.to_string())
        } else {
            Self::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            other => {
                tracing::error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(serde_json::json!({ "error": MASKED_ERROR_MESSAGE })),
                )
                    .into_response()
            }
        }
    }
}

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, RelayError>;
