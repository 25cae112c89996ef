//! Circuit breaker keyed by operation kind.
//!
//! Tracks consecutive failures per operation kind ("sync", "push",
//! "webhook") and stops issuing calls once a threshold is crossed:
//!
//! - Closed: normal operation, calls pass through
//! - Open: threshold reached, calls rejected until the cooldown elapses
//! - HalfOpen: cooldown elapsed, exactly one trial call allowed; success
//!   closes the circuit, failure reopens it and restarts the cooldown
//!
//! Streaks and the opened-at marker live in the shared [`CounterStore`], so
//! concurrent workers observe one circuit per kind instead of tripping
//! independently.

use crate::store::CounterStore;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Circuit state derived from the stored streak and opened-at marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: i64,
    /// How long the circuit stays open before allowing a trial call.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(300),
        }
    }
}

/// Rejection raised when the circuit for an operation kind is open.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit open for {kind}, retry in {retry_in:?}")]
    Open { kind: String, retry_in: Duration },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Point-in-time circuit view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub operation_kind: String,
    pub state: CircuitState,
    pub consecutive_failures: i64,
    pub opened_at: Option<DateTime<Utc>>,
    pub retry_in_secs: Option<u64>,
}

pub struct CircuitBreaker {
    store: Arc<dyn CounterStore>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CounterStore>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker { store, config }
    }

    fn failures_key(kind: &str) -> String {
        format!("circuit:{kind}:failures")
    }

    fn opened_key(kind: &str) -> String {
        format!("circuit:{kind}:opened_at")
    }

    fn trial_key(kind: &str) -> String {
        format!("circuit:{kind}:trial")
    }

    async fn derive_state(&self, kind: &str) -> anyhow::Result<(CircuitState, i64, Option<DateTime<Utc>>)> {
        let failures = self
            .store
            .get(&Self::failures_key(kind))
            .await?
            .unwrap_or(0);
        if failures < self.config.failure_threshold {
            return Ok((CircuitState::Closed, failures, None));
        }

        let opened_at = self
            .store
            .get(&Self::opened_key(kind))
            .await?
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let Some(opened_at) = opened_at else {
            // Threshold crossed but no marker (e.g. partial reset); behave
            // as freshly opened.
            return Ok((CircuitState::Open, failures, None));
        };

        let elapsed = (Utc::now() - opened_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed < self.config.open_timeout {
            Ok((CircuitState::Open, failures, Some(opened_at)))
        } else {
            Ok((CircuitState::HalfOpen, failures, Some(opened_at)))
        }
    }

    /// Gate a call on the circuit for `kind`.
    ///
    /// Closed circuits pass. Open circuits reject with the remaining
    /// cooldown. Half-open circuits admit exactly one trial caller; the
    /// trial claim is an atomic increment so concurrent workers cannot both
    /// win it.
    pub async fn guard(&self, kind: &str) -> Result<(), CircuitError> {
        let (state, _, opened_at) = self.derive_state(kind).await?;
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_in = opened_at
                    .map(|at| {
                        let reopen = at
                            + chrono::Duration::from_std(self.config.open_timeout)
                                .unwrap_or(chrono::Duration::zero());
                        (reopen - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                    })
                    .unwrap_or(self.config.open_timeout);
                Err(CircuitError::Open {
                    kind: kind.to_string(),
                    retry_in,
                })
            }
            CircuitState::HalfOpen => {
                let claims = self.store.increment(&Self::trial_key(kind), 1).await?;
                if claims == 1 {
                    tracing::info!(kind, "circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(CircuitError::Open {
                        kind: kind.to_string(),
                        retry_in: self.config.open_timeout,
                    })
                }
            }
        }
    }

    /// Record a successful call: the failure streak resets unconditionally
    /// and the circuit closes from any state.
    pub async fn record_success(&self, kind: &str) -> anyhow::Result<()> {
        self.store.set(&Self::failures_key(kind), 0).await?;
        self.store.delete(&Self::opened_key(kind)).await?;
        self.store.delete(&Self::trial_key(kind)).await?;
        Ok(())
    }

    /// Record a failed call and return the resulting state.
    pub async fn record_failure(&self, kind: &str) -> anyhow::Result<CircuitState> {
        let failures = self.store.increment(&Self::failures_key(kind), 1).await?;
        if failures >= self.config.failure_threshold {
            self.store
                .set(&Self::opened_key(kind), Utc::now().timestamp_millis())
                .await?;
            self.store.delete(&Self::trial_key(kind)).await?;
            tracing::warn!(
                kind,
                consecutive_failures = failures,
                open_timeout_secs = self.config.open_timeout.as_secs(),
                "circuit opened"
            );
            return Ok(CircuitState::Open);
        }
        Ok(CircuitState::Closed)
    }

    pub async fn state(&self, kind: &str) -> anyhow::Result<CircuitState> {
        Ok(self.derive_state(kind).await?.0)
    }

    pub async fn status(&self, kind: &str) -> anyhow::Result<CircuitSnapshot> {
        let (state, consecutive_failures, opened_at) = self.derive_state(kind).await?;
        let retry_in_secs = match (state, opened_at) {
            (CircuitState::Open, Some(at)) => {
                let reopen = at
                    + chrono::Duration::from_std(self.config.open_timeout)
                        .unwrap_or(chrono::Duration::zero());
                Some((reopen - Utc::now()).to_std().unwrap_or(Duration::ZERO).as_secs())
            }
            _ => None,
        };
        Ok(CircuitSnapshot {
            operation_kind: kind.to_string(),
            state,
            consecutive_failures,
            opened_at,
            retry_in_secs,
        })
    }

    /// Administrative reset back to Closed.
    pub async fn reset(&self, kind: &str) -> anyhow::Result<()> {
        self.record_success(kind).await?;
        tracing::info!(kind, "circuit reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn breaker(threshold: i64, open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(MemoryCounterStore::new()),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout,
            },
        )
    }

    #[tokio::test]
    async fn stays_closed_below_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure("sync").await.unwrap();
        cb.record_failure("sync").await.unwrap();
        assert_eq!(cb.state("sync").await.unwrap(), CircuitState::Closed);
        assert!(cb.guard("sync").await.is_ok());
    }

    #[tokio::test]
    async fn opens_at_exactly_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            assert_eq!(
                cb.record_failure("sync").await.unwrap(),
                CircuitState::Closed
            );
        }
        assert_eq!(cb.record_failure("sync").await.unwrap(), CircuitState::Open);

        let err = cb.guard("sync").await.unwrap_err();
        match err {
            CircuitError::Open { kind, retry_in } => {
                assert_eq!(kind, "sync");
                assert!(retry_in <= Duration::from_secs(60));
            }
            other => panic!("expected Open, got {other}"),
        }
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_trial() {
        let cb = breaker(2, Duration::from_millis(30));
        cb.record_failure("push").await.unwrap();
        cb.record_failure("push").await.unwrap();
        assert!(cb.guard("push").await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cb.state("push").await.unwrap(), CircuitState::HalfOpen);

        assert!(cb.guard("push").await.is_ok(), "first trial admitted");
        assert!(cb.guard("push").await.is_err(), "second trial rejected");
    }

    #[tokio::test]
    async fn trial_success_closes_circuit() {
        let cb = breaker(2, Duration::from_millis(30));
        cb.record_failure("sync").await.unwrap();
        cb.record_failure("sync").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        cb.guard("sync").await.unwrap();
        cb.record_success("sync").await.unwrap();

        assert_eq!(cb.state("sync").await.unwrap(), CircuitState::Closed);
        let snapshot = cb.status("sync").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.opened_at.is_none());
    }

    #[tokio::test]
    async fn trial_failure_reopens_and_restarts_timeout() {
        let cb = breaker(2, Duration::from_millis(30));
        cb.record_failure("sync").await.unwrap();
        cb.record_failure("sync").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        cb.guard("sync").await.unwrap();
        assert_eq!(cb.record_failure("sync").await.unwrap(), CircuitState::Open);
        assert!(cb.guard("sync").await.is_err(), "freshly reopened");

        // After another timeout a new trial is allowed again.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.guard("sync").await.is_ok());
    }

    #[tokio::test]
    async fn success_resets_streak_from_any_state() {
        let cb = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            cb.record_failure("webhook").await.unwrap();
        }
        cb.record_success("webhook").await.unwrap();

        let snapshot = cb.status("webhook").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.record_failure("sync").await.unwrap();
        cb.record_failure("sync").await.unwrap();
        assert!(cb.guard("sync").await.is_err());
        assert!(cb.guard("webhook").await.is_ok());
    }

    #[tokio::test]
    async fn shared_store_shares_circuit_across_instances() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
        };
        let worker_a = CircuitBreaker::new(store.clone(), config.clone());
        let worker_b = CircuitBreaker::new(store, config);

        worker_a.record_failure("sync").await.unwrap();
        worker_b.record_failure("sync").await.unwrap();

        assert_eq!(worker_a.state("sync").await.unwrap(), CircuitState::Open);
        assert_eq!(worker_b.state("sync").await.unwrap(), CircuitState::Open);
    }
}
