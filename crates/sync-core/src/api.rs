//! Wire-level failure taxonomy and rate-limit metadata produced by CRM
//! client implementations.
//!
//! The request building itself lives behind the client trait in the main
//! crate; this module only defines the shapes every implementation reports
//! back so the error classifier and the rate limiter can reason about them
//! without knowing the transport.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Rate-limit metadata carried on a provider response, parsed from headers
/// such as `x-ratelimit-remaining` / `x-ratelimit-reset` / `retry-after`.
///
/// All fields are optional; providers differ in what they advertise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateMeta {
    /// Daily budget the provider reports for this endpoint class.
    pub limit: Option<i64>,
    /// Remaining budget the provider reports.
    pub remaining: Option<i64>,
    /// Budget already consumed, when reported directly.
    pub used: Option<i64>,
    /// Instant at which the provider says the budget resets.
    pub reset_at: Option<DateTime<Utc>>,
    /// Explicit wait the provider requested before the next call.
    pub retry_after: Option<Duration>,
}

impl RateMeta {
    /// Whether the provider sent anything the limiter can use to override
    /// its local accounting.
    pub fn has_budget_info(&self) -> bool {
        self.limit.is_some()
            || self.remaining.is_some()
            || self.used.is_some()
            || self.reset_at.is_some()
    }
}

/// Network-layer failure subtype, used to pick a backoff appropriate for
/// the layer that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    Dns,
    Tls,
    Refused,
    Reset,
}

impl std::fmt::Display for ConnectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectKind::Dns => "dns resolution failed",
            ConnectKind::Tls => "tls handshake failed",
            ConnectKind::Refused => "connection refused",
            ConnectKind::Reset => "connection reset",
        };
        f.write_str(s)
    }
}

/// A failed remote call, as reported by a CRM client implementation.
///
/// Variants stay close to the wire so the classifier owns all policy; a
/// client maps status codes and transport errors into these shapes and
/// nothing else.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// 429 or provider-specific burst rejection.
    #[error("rate limited by provider")]
    RateLimited {
        retry_after: Option<Duration>,
        meta: RateMeta,
    },

    /// 401/403: credentials rejected or permission missing.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 402 or provider-specific plan/quota exhaustion.
    #[error("plan limit reached: {0}")]
    PlanLimit(String),

    /// 5xx from the provider.
    #[error("upstream server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The per-call timeout elapsed before a response arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    Connect(ConnectKind),

    /// The provider responded with a payload we could not parse.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Rate metadata attached to this failure, if the provider sent any.
    pub fn rate_meta(&self) -> Option<&RateMeta> {
        match self {
            ApiError::RateLimited { meta, .. } => Some(meta),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_meta_detects_budget_info() {
        assert!(!RateMeta::default().has_budget_info());

        let meta = RateMeta {
            remaining: Some(120),
            ..Default::default()
        };
        assert!(meta.has_budget_info());
    }

    #[test]
    fn api_error_exposes_rate_meta() {
        let err = ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
            meta: RateMeta {
                remaining: Some(0),
                ..Default::default()
            },
        };
        assert!(err.rate_meta().is_some());
        assert!(ApiError::Timeout(Duration::from_secs(30)).rate_meta().is_none());
    }
}
