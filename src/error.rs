use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::smtp::SmtpError;

#[derive(Debug, Error)]
pub enum MailQueueError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Template error: {0}")]
    Template(String),
}

pub type Result<T> = std::result::Result<T, MailQueueError>;

/// Closed set of API error codes. Each code carries its HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    IdempotencyConflict,
    DuplicateQueue,
    SuppressedEmail,
    RateLimitExceeded,
    QueuePaused,
    QueueNotFound,
    InvalidSmtpConfig,
    LimitExceeded,
    InternalError,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::IdempotencyConflict => StatusCode::CONFLICT,
            ErrorCode::DuplicateQueue => StatusCode::CONFLICT,
            ErrorCode::SuppressedEmail => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::QueuePaused => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::QueueNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidSmtpConfig => StatusCode::BAD_REQUEST,
            ErrorCode::LimitExceeded => StatusCode::FORBIDDEN,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ErrorCode::DuplicateQueue => "DUPLICATE_QUEUE",
            ErrorCode::SuppressedEmail => "SUPPRESSED_EMAIL",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::QueuePaused => "QUEUE_PAUSED",
            ErrorCode::QueueNotFound => "QUEUE_NOT_FOUND",
            ErrorCode::InvalidSmtpConfig => "INVALID_SMTP_CONFIG",
            ErrorCode::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// API-surface error: code + message + optional structured details.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// Seconds until the caller may retry, surfaced as a Retry-After header.
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl From<MailQueueError> for ApiError {
    fn from(err: MailQueueError) -> Self {
        match err {
            MailQueueError::InvalidInput(msg) => ApiError::validation(msg),
            other => {
                tracing::error!("Internal error surfaced to API: {}", other);
                ApiError::internal("An internal error occurred")
            }
        }
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(err: sea_orm::DbErr) -> Self {
        tracing::error!("Database error surfaced to API: {}", err);
        ApiError::internal("An internal error occurred")
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("Serialization error surfaced to API: {}", err);
        ApiError::internal("An internal error occurred")
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code.as_str(),
                message: self.message,
                details: self.details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_expected_status() {
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::SuppressedEmail.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorCode::RateLimitExceeded.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::QueuePaused.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::QueueNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::IdempotencyConflict.http_status(), StatusCode::CONFLICT);
    }

    #[test]
    fn invalid_input_maps_to_validation_error() {
        let api: ApiError = MailQueueError::InvalidInput("bad address".to_string()).into();
        assert_eq!(api.code, ErrorCode::ValidationError);
        assert_eq!(api.message, "bad address");
    }
}
