use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),
    #[error("Invalid edge: {0}, must be rising, falling or both")]
    InvalidEdgeKind(String),
    #[error("Channel {0} has not been set up as an input")]
    NotConfiguredAsInput(String),
    #[error("Channel {0} has not been set up as an output")]
    NotConfiguredAsOutput(String),
    #[error("Channel {0} has not been set up")]
    NotConfigured(String),
    #[error("Edge detection already enabled for channel {0}")]
    AlreadyWatched(String),
    #[error("Edge detection not enabled for channel {0}")]
    NotWatched(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("I/O failure (code {code}): {message}")]
    Io { code: i32, message: String },
    #[error("Handler for channel {channel} failed: {reason}")]
    HandlerFault { channel: String, reason: String },
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn io(code: i32, message: impl Into<String>) -> Self {
        AppError::Io {
            code,
            message: message.into(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidChannel(_) => StatusCode::NOT_FOUND,
            AppError::InvalidEdgeKind(_)
            | AppError::NotConfiguredAsInput(_)
            | AppError::NotConfiguredAsOutput(_)
            | AppError::NotConfigured(_)
            | AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::AlreadyWatched(_) | AppError::NotWatched(_) => StatusCode::CONFLICT,
            AppError::OutOfMemory(_)
            | AppError::Io { .. }
            | AppError::HandlerFault { .. }
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
