//! Error taxonomy shared across the pipeline.
//!
//! Every failure that crosses a module boundary is a [`PipelineError`]
//! carrying one of the closed [`ErrorKind`] tags. The retry wrapper
//! decides from the tag whether an operation is worth repeating, and the
//! error ledger stores the tag's wire name alongside the redacted message.

use thiserror::Error;

/// Closed set of error categories recorded in the error ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Api,
    RateLimit,
    Timeout,
    Validation,
    Auth,
    Processing,
    RetryExhausted,
    CircuitOpen,
    RateLimiter,
    Storage,
    InvalidGrant,
}

impl ErrorKind {
    /// Wire name stored in the `error_log` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Api => "api_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Processing => "processing_error",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimiter => "rate_limiter_error",
            ErrorKind::Storage => "storage_error",
            ErrorKind::InvalidGrant => "invalid_grant",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure type for every fallible pipeline operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("api error from {service}: {message}")]
    Api { service: String, message: String },

    #[error("rate limited by {service}: {message}")]
    RateLimit { service: String, message: String },

    #[error("timeout after {seconds}s calling {service}")]
    Timeout { service: String, seconds: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("auth failure for {service}: {message}")]
    Auth { service: String, message: String },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("all {attempts} attempts exhausted: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<PipelineError>,
    },

    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("rate limiter store error: {0}")]
    RateLimiter(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid_grant for {service}: manual re-auth required")]
    InvalidGrant { service: String },
}

impl PipelineError {
    pub fn api(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PipelineError::Api {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(service: impl Into<String>, seconds: u64) -> Self {
        PipelineError::Timeout {
            service: service.into(),
            seconds,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Api { .. } => ErrorKind::Api,
            PipelineError::RateLimit { .. } => ErrorKind::RateLimit,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Auth { .. } => ErrorKind::Auth,
            PipelineError::Processing(_) => ErrorKind::Processing,
            PipelineError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            PipelineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PipelineError::RateLimiter(_) => ErrorKind::RateLimiter,
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::InvalidGrant { .. } => ErrorKind::InvalidGrant,
        }
    }

    /// Service tag for the error ledger, when one is attached.
    pub fn service(&self) -> Option<&str> {
        match self {
            PipelineError::Api { service, .. }
            | PipelineError::RateLimit { service, .. }
            | PipelineError::Timeout { service, .. }
            | PipelineError::Auth { service, .. }
            | PipelineError::CircuitOpen { service }
            | PipelineError::InvalidGrant { service } => Some(service),
            PipelineError::RetryExhausted { last, .. } => last.service(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation(format!("json: {err}"))
    }
}

/// Map a reqwest failure onto the taxonomy, attributing it to `service`.
pub fn http_error(service: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::timeout(service, 30)
    } else if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
        PipelineError::RateLimit {
            service: service.to_string(),
            message: err.to_string(),
        }
    } else if matches!(
        err.status(),
        Some(reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN)
    ) {
        PipelineError::Auth {
            service: service.to_string(),
            message: err.to_string(),
        }
    } else {
        PipelineError::api(service, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_are_stable() {
        assert_eq!(ErrorKind::Api.as_str(), "api_error");
        assert_eq!(ErrorKind::RetryExhausted.as_str(), "retry_exhausted");
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(ErrorKind::InvalidGrant.as_str(), "invalid_grant");
        assert_eq!(ErrorKind::RateLimiter.as_str(), "rate_limiter_error");
    }

    #[test]
    fn test_retry_exhausted_reports_inner_service() {
        let inner = PipelineError::api("marketplace", "503");
        let err = PipelineError::RetryExhausted {
            attempts: 3,
            last: Box::new(inner),
        };
        assert_eq!(err.service(), Some("marketplace"));
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
    }
}
