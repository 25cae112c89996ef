//! Failure classification and retry policy.
//!
//! Every failure the pipeline can meet is reduced to a [`ClassifiedError`]:
//! a tagged kind plus the retry policy that applies to it. Classification
//! is a pure function over the wire error, so callers match on the kind
//! instead of inspecting transport details, and the retry decision lives in
//! one place.

use serde::Serialize;
use std::time::Duration;
use sync_core::{ApiError, ConnectKind};

/// Ceiling for classified retry delays, independent of kind.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failure taxonomy for the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider rate limit hit; always retryable.
    RateLimit,
    /// Credential or permission problem; needs operator action.
    Auth,
    /// Plan/quota limit; needs operator action.
    Quota,
    /// Transient upstream 5xx.
    ServerError,
    /// Network-layer failure (timeout, DNS, TLS, refused, reset).
    Connection,
    /// Local memory pressure.
    Memory,
    /// Malformed options or event payload.
    Validation,
    /// Anything we cannot positively classify; treated conservatively.
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Quota => "quota",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Connection => "connection",
            ErrorKind::Memory => "memory",
            ErrorKind::Validation => "validation",
            ErrorKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure with its retry policy attached.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// Base delay before the next attempt, for retryable kinds.
    pub retry_after: Option<Duration>,
    /// Attempt budget for this kind, counting the first attempt.
    pub max_retries: u32,
    pub message: String,
}

impl ClassifiedError {
    fn retryable(kind: ErrorKind, base: Duration, message: String) -> Self {
        ClassifiedError {
            kind,
            retryable: true,
            retry_after: Some(base),
            max_retries: DEFAULT_MAX_RETRIES,
            message,
        }
    }

    fn fatal(kind: ErrorKind, message: String) -> Self {
        ClassifiedError {
            kind,
            retryable: false,
            retry_after: None,
            max_retries: 1,
            message,
        }
    }

    /// Local memory pressure while processing.
    pub fn memory(message: impl Into<String>) -> Self {
        Self::retryable(ErrorKind::Memory, Duration::from_secs(5), message.into())
    }

    /// Malformed options or event payload.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Validation, message.into())
    }

    /// Unclassifiable failure; conservative no-retry default.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Generic, message.into())
    }

    /// Whether another attempt is allowed after `attempt` attempts (1-based)
    /// have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.retryable && attempt < self.max_retries
    }

    /// Delay before the next attempt, doubling from the base and capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_after.unwrap_or(Duration::from_secs(30));
        let exp = attempt.saturating_sub(1).min(16);
        base.saturating_mul(2u32.saturating_pow(exp))
            .min(MAX_RETRY_DELAY)
    }
}

/// Map a wire failure to its kind and retry policy.
pub fn classify(err: &ApiError) -> ClassifiedError {
    match err {
        ApiError::RateLimited { retry_after, .. } => ClassifiedError::retryable(
            ErrorKind::RateLimit,
            retry_after.unwrap_or(Duration::from_secs(60)),
            err.to_string(),
        ),

        ApiError::Unauthorized(_) => ClassifiedError::fatal(ErrorKind::Auth, err.to_string()),

        ApiError::PlanLimit(_) => ClassifiedError::fatal(ErrorKind::Quota, err.to_string()),

        ApiError::Server { status, .. } => {
            let base = match status {
                502 => Duration::from_secs(10),
                503 => Duration::from_secs(60),
                504 => Duration::from_secs(45),
                _ => Duration::from_secs(30),
            };
            ClassifiedError::retryable(ErrorKind::ServerError, base, err.to_string())
        }

        ApiError::Timeout(_) => ClassifiedError::retryable(
            ErrorKind::Connection,
            Duration::from_secs(30),
            err.to_string(),
        ),

        ApiError::Connect(kind) => {
            let base = match kind {
                ConnectKind::Dns => Duration::from_secs(60),
                ConnectKind::Tls => Duration::from_secs(45),
                ConnectKind::Refused | ConnectKind::Reset => Duration::from_secs(15),
            };
            ClassifiedError::retryable(ErrorKind::Connection, base, err.to_string())
        }

        ApiError::Decode(_) => ClassifiedError::fatal(ErrorKind::Generic, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::RateMeta;

    #[test]
    fn rate_limit_uses_provider_delay() {
        let err = ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
            meta: RateMeta::default(),
        };
        let classified = classify(&err);
        assert_eq!(classified.kind, ErrorKind::RateLimit);
        assert!(classified.retryable);
        assert_eq!(classified.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn rate_limit_falls_back_to_sixty_seconds() {
        let err = ApiError::RateLimited {
            retry_after: None,
            meta: RateMeta::default(),
        };
        assert_eq!(classify(&err).retry_after, Some(Duration::from_secs(60)));
    }

    #[test]
    fn auth_and_quota_are_fatal() {
        let auth = classify(&ApiError::Unauthorized("bad token".into()));
        assert_eq!(auth.kind, ErrorKind::Auth);
        assert!(!auth.retryable);
        assert_eq!(auth.max_retries, 1);
        assert!(!auth.should_retry(1));

        let quota = classify(&ApiError::PlanLimit("upgrade required".into()));
        assert_eq!(quota.kind, ErrorKind::Quota);
        assert!(!quota.retryable);
    }

    #[test]
    fn server_errors_pick_status_specific_delays() {
        let cases = [
            (502u16, Duration::from_secs(10)),
            (503, Duration::from_secs(60)),
            (504, Duration::from_secs(45)),
            (500, Duration::from_secs(30)),
        ];
        for (status, expected) in cases {
            let classified = classify(&ApiError::Server {
                status,
                message: "boom".into(),
            });
            assert_eq!(classified.kind, ErrorKind::ServerError);
            assert_eq!(classified.retry_after, Some(expected), "status {status}");
        }
    }

    #[test]
    fn connection_subtypes_pick_their_delays() {
        assert_eq!(
            classify(&ApiError::Connect(ConnectKind::Dns)).retry_after,
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            classify(&ApiError::Connect(ConnectKind::Refused)).retry_after,
            Some(Duration::from_secs(15))
        );
        let timeout = classify(&ApiError::Timeout(Duration::from_secs(30)));
        assert_eq!(timeout.kind, ErrorKind::Connection);
        assert_eq!(timeout.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_budget_counts_attempts() {
        let err = classify(&ApiError::Server {
            status: 500,
            message: "boom".into(),
        });
        assert!(err.should_retry(1));
        assert!(err.should_retry(2));
        assert!(!err.should_retry(3));
        assert!(!err.should_retry(4));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let err = classify(&ApiError::Server {
            status: 503,
            message: "unavailable".into(),
        });
        assert_eq!(err.retry_delay(1), Duration::from_secs(60));
        assert_eq!(err.retry_delay(2), Duration::from_secs(120));
        assert_eq!(err.retry_delay(3), Duration::from_secs(240));
        assert_eq!(err.retry_delay(4), Duration::from_secs(300));
    }

    #[test]
    fn local_constructors_set_policy() {
        let memory = ClassifiedError::memory("rss at 96%");
        assert_eq!(memory.kind, ErrorKind::Memory);
        assert!(memory.retryable);
        assert_eq!(memory.retry_after, Some(Duration::from_secs(5)));

        let validation = ClassifiedError::validation("page_size must be positive");
        assert_eq!(validation.kind, ErrorKind::Validation);
        assert!(!validation.should_retry(1));

        let generic = ClassifiedError::generic("unexpected");
        assert!(!generic.retryable);
    }

    #[test]
    fn decode_failures_are_generic() {
        let classified = classify(&ApiError::Decode("truncated body".into()));
        assert_eq!(classified.kind, ErrorKind::Generic);
        assert!(!classified.retryable);
    }
}
