//! Errors - delivery failures and their classification.
//!
//! Every failed backend call ends up as a `DeliveryError`. The retry engine
//! only looks at its `ErrorKind`.

use std::time::Duration;

use thiserror::Error;

/// Operational classification of a delivery failure.
///
/// - Transient: network failure, timeout, 5xx, rate limit (retry)
/// - Permanent: malformed or rejected payload (retrying cannot help)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// A failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out after {timeout_seconds}s")]
    Timeout { timeout_seconds: u64 },

    #[error("client error: HTTP {status_code}: {body}")]
    Client { status_code: u16, body: String },

    #[error("server error: HTTP {status_code}: {body}")]
    Server { status_code: u16, body: String },

    #[error("rate limited: HTTP 429")]
    RateLimited { retry_after: Option<Duration> },

    /// The record cannot be turned into a backend request at all.
    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
}

impl DeliveryError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_seconds: timeout.as_secs(),
        }
    }

    pub fn client(status_code: u16, body: impl Into<String>) -> Self {
        Self::Client {
            status_code,
            body: body.into(),
        }
    }

    pub fn server(status_code: u16, body: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            body: body.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// 408, 422 and 429 are worth retrying even though they are 4xx.
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match status_code {
            429 => Self::RateLimited { retry_after },
            400..=499 => Self::client(status_code, body),
            _ => Self::server(status_code, body),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Network { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::Server { .. }
            | DeliveryError::RateLimited { .. } => ErrorKind::Transient,
            DeliveryError::Client { status_code, .. } => match status_code {
                408 | 422 => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            DeliveryError::MalformedPayload { .. } => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Client { status_code, .. } | DeliveryError::Server { status_code, .. } => {
                Some(*status_code)
            }
            DeliveryError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
