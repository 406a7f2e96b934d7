#[cfg(feature = "server")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
#[cfg(feature = "server")]
use serde_json::json;
use thiserror::Error;

use crate::{
    STATUS_ALL_FAILED, STATUS_BAD_REQUEST, STATUS_INVALID_DOMAIN, STATUS_NOT_FOUND,
    STATUS_RATE_LIMITED, STATUS_SERVER_ERROR, STATUS_TIMEOUT,
};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Unsupported TLD: {0}")]
    UnsupportedTld(String),

    #[error("Network timeout")]
    Timeout,

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Domain not registered")]
    NotFound,

    #[error("Upstream returned HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Malformed upstream payload: {0}")]
    BadPayload(String),

    #[error("Redirect limit exceeded after {0} hops")]
    RedirectLimit(usize),

    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("Worker queue full")]
    ServiceBusy,

    #[error("IO error: {0}")]
    IoError(#[from] tokio::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Response too large")]
    ResponseTooLarge,

    #[error("Invalid UTF-8 in response")]
    InvalidUtf8,

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Cache error: {0}")]
    CacheError(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::time::error::Elapsed> for QueryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        QueryError::Timeout
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::BadPayload(e.to_string())
    }
}

impl QueryError {
    /// Failure-class status code carried by taxonomized failure records.
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::InvalidDomain(_) | QueryError::UnsupportedTld(_) => STATUS_INVALID_DOMAIN,
            QueryError::MissingParameter(_) => STATUS_BAD_REQUEST,
            QueryError::Timeout => STATUS_TIMEOUT,
            QueryError::RateLimited(_) => STATUS_RATE_LIMITED,
            QueryError::NotFound => STATUS_NOT_FOUND,
            QueryError::UpstreamStatus { status, .. } => *status,
            QueryError::AllProvidersFailed(_) | QueryError::ServiceBusy | QueryError::CircuitOpen(_) => {
                STATUS_ALL_FAILED
            }
            _ => STATUS_SERVER_ERROR,
        }
    }

    /// Machine-readable error code surfaced in the HTTP envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            QueryError::ServiceBusy => "SERVICE_BUSY",
            other => error_code_for_status(other.status_code()),
        }
    }

    /// Whether the failure looks like upstream throttling, including
    /// rate-limit wording from providers that answer 200 with an error body.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            QueryError::RateLimited(_) => true,
            QueryError::UpstreamStatus { status: 429, .. } => true,
            QueryError::UpstreamStatus { message, .. } | QueryError::BadPayload(message) => {
                let lower = message.to_ascii_lowercase();
                lower.contains("rate limit") || lower.contains("too many requests")
            }
            _ => false,
        }
    }
}

/// Map a failure-class status code to the envelope error code.
pub fn error_code_for_status(status: u16) -> &'static str {
    match status {
        STATUS_BAD_REQUEST => "MISSING_PARAMETER",
        STATUS_INVALID_DOMAIN => "INVALID_DOMAIN",
        STATUS_RATE_LIMITED => "RATE_LIMITED",
        STATUS_TIMEOUT => "TIMEOUT",
        _ => "QUERY_ERROR",
    }
}

#[cfg(feature = "server")]
impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self {
            QueryError::Internal(_) | QueryError::CacheError(_) | QueryError::IoError(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.error_code(),
                "message": message,
            },
            "meta": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}
