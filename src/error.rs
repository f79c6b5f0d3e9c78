use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ThrottlerError {
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    ValidationError(String),

    #[error("body must not be larger than {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("the request took too long to complete")]
    RequestTimeout,

    #[error("the requested resource could not be found")]
    NotFound,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The drain deadline elapsed before in-flight work finished.
    #[error("graceful shutdown did not complete within {deadline:?} ({pending_tasks} background task(s) still running)")]
    ShutdownTimeout {
        deadline: Duration,
        pending_tasks: usize,
    },
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

impl ThrottlerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ThrottlerError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ThrottlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ThrottlerError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ThrottlerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ThrottlerError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            ThrottlerError::NotFound => StatusCode::NOT_FOUND,
            ThrottlerError::ConfigurationError(_)
            | ThrottlerError::InternalError(_)
            | ThrottlerError::Io(_)
            | ThrottlerError::ShutdownTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON envelope for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn server_error() -> Self {
        Self::new("the server encountered a problem and could not process your request")
    }

    pub fn from_throttler_error(err: &ThrottlerError) -> Self {
        if err.status_code().is_server_error() {
            // Internal details stay in the logs.
            Self::server_error()
        } else {
            Self::new(err.to_string())
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        (status, Json(ErrorResponse::from_throttler_error(&self))).into_response()
    }
}
