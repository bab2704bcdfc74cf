//! Classified remote-call errors

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Retry classification of a remote-call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Rate-limited, temporarily unavailable, timed out
    RetryableTransient,
    /// Optimistic-concurrency mismatch; safe to retry after re-reading state
    RetryableConflict,
    /// Bad request, not found, permission denied. Never retried.
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RetryableTransient => "retryable-transient",
            FailureClass::RetryableConflict => "retryable-conflict",
            FailureClass::Fatal => "fatal",
        }
    }
}

/// Classified remote-call failure reported by a `RemoteApiClient`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    /// 429-style throttling from the remote service
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Server-provided Retry-After hint
        retry_after_ms: Option<u64>,
    },

    #[error("Service unavailable: {message}")]
    Unavailable { message: String },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Revision / etag mismatch
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// Shutdown or other local condition that stopped the call
    #[error("Internal error: {0}")]
    Internal(String),
}

static RATE_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|quota|too many requests|resource[ _]?exhausted")
        .expect("rate limit pattern is valid")
});

impl RemoteError {
    /// Retry class of this failure
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::RateLimited { .. } => FailureClass::RetryableTransient,
            RemoteError::Unavailable { .. } => FailureClass::RetryableTransient,
            RemoteError::Timeout { .. } => FailureClass::RetryableTransient,

            RemoteError::Conflict { .. } => FailureClass::RetryableConflict,

            RemoteError::BadRequest { .. } => FailureClass::Fatal,
            RemoteError::NotFound { .. } => FailureClass::Fatal,
            RemoteError::PermissionDenied { .. } => FailureClass::Fatal,
            RemoteError::Internal(_) => FailureClass::Fatal,
        }
    }

    /// Whether this failure should shrink the admission limit
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Server hint for how long to wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        RemoteError::RateLimited {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Classify an HTTP status plus error message from the remote API
    ///
    /// The spreadsheet API reports per-user quota exhaustion as 403 with a
    /// `rateLimitExceeded` reason, so a 403 is only a permission failure when
    /// the message does not mention rate limits or quota.
    pub fn from_status(status: u16, message: &str) -> Self {
        let message = message.to_string();
        match status {
            429 => RemoteError::RateLimited {
                message,
                retry_after_ms: None,
            },
            403 if RATE_LIMIT_PATTERN.is_match(&message) => RemoteError::RateLimited {
                message,
                retry_after_ms: None,
            },
            401 | 403 => RemoteError::PermissionDenied { message },
            404 => RemoteError::NotFound { message },
            408 | 504 => RemoteError::Timeout { timeout_ms: 0 },
            409 | 412 => RemoteError::Conflict { message },
            400..=499 => RemoteError::BadRequest { message },
            500..=599 => RemoteError::Unavailable { message },
            _ => RemoteError::Internal(format!("unexpected status {}: {}", status, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            RemoteError::rate_limited("slow down").class(),
            FailureClass::RetryableTransient
        );
        assert_eq!(
            RemoteError::Timeout { timeout_ms: 30_000 }.class(),
            FailureClass::RetryableTransient
        );
        assert_eq!(
            RemoteError::Conflict {
                message: "revision mismatch".to_string()
            }
            .class(),
            FailureClass::RetryableConflict
        );
        assert_eq!(
            RemoteError::BadRequest {
                message: "bad range".to_string()
            }
            .class(),
            FailureClass::Fatal
        );
        assert!(!RemoteError::Internal("closed".to_string()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(RemoteError::from_status(429, "Too Many Requests").is_rate_limit());
        assert!(RemoteError::from_status(403, "User rateLimitExceeded").is_rate_limit());
        assert!(RemoteError::from_status(403, "Quota exceeded for quota metric").is_rate_limit());
        assert_eq!(
            RemoteError::from_status(403, "The caller does not have permission").class(),
            FailureClass::Fatal
        );
        assert_eq!(
            RemoteError::from_status(503, "backend error").class(),
            FailureClass::RetryableTransient
        );
        assert_eq!(
            RemoteError::from_status(409, "aborted").class(),
            FailureClass::RetryableConflict
        );
        assert_eq!(
            RemoteError::from_status(404, "Requested entity was not found").class(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_retry_after_hint() {
        let err = RemoteError::RateLimited {
            message: "slow".to_string(),
            retry_after_ms: Some(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(RemoteError::rate_limited("slow").retry_after(), None);
    }
}
