//! Daily token-budget accounting per endpoint class.
//!
//! The remote CRM allots a daily budget of weighted request costs per
//! endpoint class. Consumption goes through the shared [`CounterStore`] as
//! a single atomic increment so concurrent workers cannot collectively
//! over-spend; a consume that lands past the limit is rolled back and
//! rejected with the recommended wait.
//!
//! Provider-advertised budget values (remaining/used/reset headers) always
//! override local estimates once observed. The limiter itself never sleeps;
//! callers decide whether to block for [`RateLimiter::wait_duration`] or to
//! reschedule.

use crate::store::CounterStore;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sync_core::RateMeta;
use tokio::sync::Mutex;

/// Endpoint class against which a call is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    Read,
    Write,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 2] = [EndpointClass::Read, EndpointClass::Write];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Read => "read",
            EndpointClass::Write => "write",
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub read_daily_limit: i64,
    pub write_daily_limit: i64,
    /// Base delay for the exponential wait sequence.
    pub base_delay: Duration,
    /// Ceiling for the exponential wait sequence.
    pub max_delay: Duration,
    /// Uniform jitter fraction applied to waits, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            read_daily_limit: 10_000,
            write_daily_limit: 10_000,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

/// Typed rejection carrying the recommended wait.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("daily budget exhausted for {class} endpoints, retry in {retry_in:?}")]
    Exhausted {
        class: EndpointClass,
        retry_in: Duration,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Point-in-time budget view for the status surface and sync results.
#[derive(Debug, Clone, Serialize)]
pub struct RateSnapshot {
    pub endpoint_class: EndpointClass,
    pub daily_limit: i64,
    pub consumed_today: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct ProviderOverride {
    limit: Option<i64>,
    reset_at: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimiterConfig,
    overrides: Mutex<HashMap<EndpointClass, ProviderOverride>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimiterConfig) -> Self {
        RateLimiter {
            store,
            config,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Budget counters are scoped per UTC day, so a new day starts from a
    /// fresh key instead of requiring a reset job.
    fn counter_key(class: EndpointClass, now: DateTime<Utc>) -> String {
        format!(
            "rate:{}:{:04}{:02}{:02}",
            class,
            now.year(),
            now.month(),
            now.day()
        )
    }

    fn configured_limit(&self, class: EndpointClass) -> i64 {
        match class {
            EndpointClass::Read => self.config.read_daily_limit,
            EndpointClass::Write => self.config.write_daily_limit,
        }
    }

    async fn effective_limit(&self, class: EndpointClass) -> i64 {
        let overrides = self.overrides.lock().await;
        overrides
            .get(&class)
            .and_then(|o| o.limit)
            .unwrap_or_else(|| self.configured_limit(class))
    }

    async fn reset_instant(&self, class: EndpointClass) -> DateTime<Utc> {
        let now = Utc::now();
        let overrides = self.overrides.lock().await;
        if let Some(reset_at) = overrides.get(&class).and_then(|o| o.reset_at) {
            if reset_at > now {
                return reset_at;
            }
        }
        next_utc_midnight(now)
    }

    async fn until_reset(&self, class: EndpointClass) -> Duration {
        let reset_at = self.reset_instant(class).await;
        (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Remaining-capacity test without consuming.
    pub async fn can_consume(&self, class: EndpointClass, cost: i64) -> anyhow::Result<bool> {
        let key = Self::counter_key(class, Utc::now());
        let consumed = self.store.get(&key).await?.unwrap_or(0);
        Ok(self.effective_limit(class).await - consumed >= cost)
    }

    /// Atomically bill `cost` against the class budget.
    ///
    /// The increment-then-check shape keeps concurrent workers honest: a
    /// consume that lands past the limit is rolled back and rejected, so the
    /// recorded consumption of successful calls never exceeds the budget.
    pub async fn consume(&self, class: EndpointClass, cost: i64) -> Result<(), RateLimitError> {
        let key = Self::counter_key(class, Utc::now());
        let new_value = self.store.increment(&key, cost).await?;
        if new_value > self.effective_limit(class).await {
            self.store.increment(&key, -cost).await?;
            let retry_in = self.until_reset(class).await;
            tracing::warn!(
                class = %class,
                retry_in_secs = retry_in.as_secs(),
                "daily budget exhausted, rejecting consume"
            );
            return Err(RateLimitError::Exhausted { class, retry_in });
        }
        Ok(())
    }

    /// Jittered exponential wait for the given attempt number (1-based).
    pub fn wait_duration(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.max_delay);
        if self.config.jitter <= 0.0 {
            return raw;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.config.jitter..=1.0 + self.config.jitter);
        raw.mul_f64(factor)
    }

    /// Fold provider-advertised budget values into local accounting.
    ///
    /// Advertised used/remaining counts replace the local counter, and an
    /// advertised reset instant replaces the UTC-midnight default for the
    /// rest of the day.
    pub async fn observe(&self, class: EndpointClass, meta: &RateMeta) -> anyhow::Result<()> {
        if !meta.has_budget_info() {
            return Ok(());
        }

        {
            let mut overrides = self.overrides.lock().await;
            let entry = overrides.entry(class).or_default();
            if meta.limit.is_some() {
                entry.limit = meta.limit;
            }
            if meta.reset_at.is_some() {
                entry.reset_at = meta.reset_at;
            }
        }

        let consumed = match (meta.used, meta.limit, meta.remaining) {
            (Some(used), _, _) => Some(used),
            (None, Some(limit), Some(remaining)) => Some((limit - remaining).max(0)),
            _ => None,
        };
        if let Some(consumed) = consumed {
            let key = Self::counter_key(class, Utc::now());
            self.store.set(&key, consumed).await?;
            tracing::debug!(class = %class, consumed, "adopted provider budget accounting");
        }
        Ok(())
    }

    pub async fn status(&self, class: EndpointClass) -> anyhow::Result<RateSnapshot> {
        let key = Self::counter_key(class, Utc::now());
        let consumed_today = self.store.get(&key).await?.unwrap_or(0);
        let daily_limit = self.effective_limit(class).await;
        Ok(RateSnapshot {
            endpoint_class: class,
            daily_limit,
            consumed_today,
            remaining: (daily_limit - consumed_today).max(0),
            reset_at: self.reset_instant(class).await,
        })
    }

    /// Administrative reset: clears consumption and provider overrides.
    pub async fn reset(&self, class: EndpointClass) -> anyhow::Result<()> {
        let key = Self::counter_key(class, Utc::now());
        self.store.delete(&key).await?;
        self.overrides.lock().await.remove(&class);
        tracing::info!(class = %class, "rate budget reset");
        Ok(())
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn limiter(limit: i64) -> RateLimiter {
        let config = RateLimiterConfig {
            read_daily_limit: limit,
            write_daily_limit: limit,
            ..Default::default()
        };
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), config)
    }

    #[tokio::test]
    async fn consume_within_budget_succeeds() {
        let limiter = limiter(10);
        assert!(limiter.can_consume(EndpointClass::Read, 5).await.unwrap());
        limiter.consume(EndpointClass::Read, 5).await.unwrap();
        limiter.consume(EndpointClass::Read, 5).await.unwrap();

        let snapshot = limiter.status(EndpointClass::Read).await.unwrap();
        assert_eq!(snapshot.consumed_today, 10);
        assert_eq!(snapshot.remaining, 0);
    }

    #[tokio::test]
    async fn exhausted_budget_rejects_with_wait() {
        let limiter = limiter(3);
        limiter.consume(EndpointClass::Read, 3).await.unwrap();

        let err = limiter.consume(EndpointClass::Read, 1).await.unwrap_err();
        match err {
            RateLimitError::Exhausted { class, retry_in } => {
                assert_eq!(class, EndpointClass::Read);
                assert!(retry_in <= Duration::from_secs(24 * 3600));
            }
            other => panic!("expected Exhausted, got {other}"),
        }

        // The rejected cost was rolled back.
        let snapshot = limiter.status(EndpointClass::Read).await.unwrap();
        assert_eq!(snapshot.consumed_today, 3);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_overspend() {
        let limiter = Arc::new(limiter(100));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut granted = 0;
                for _ in 0..25 {
                    if limiter.consume(EndpointClass::Write, 1).await.is_ok() {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let mut total_granted = 0;
        for handle in handles {
            total_granted += handle.await.unwrap();
        }
        assert_eq!(total_granted, 100);

        let snapshot = limiter.status(EndpointClass::Write).await.unwrap();
        assert!(snapshot.consumed_today <= 100);
    }

    #[tokio::test]
    async fn classes_have_independent_budgets() {
        let limiter = limiter(2);
        limiter.consume(EndpointClass::Read, 2).await.unwrap();
        assert!(limiter.consume(EndpointClass::Read, 1).await.is_err());
        limiter.consume(EndpointClass::Write, 1).await.unwrap();
    }

    #[tokio::test]
    async fn provider_accounting_overrides_local() {
        let limiter = limiter(100);
        limiter.consume(EndpointClass::Read, 10).await.unwrap();

        let meta = RateMeta {
            limit: Some(50),
            remaining: Some(5),
            ..Default::default()
        };
        limiter.observe(EndpointClass::Read, &meta).await.unwrap();

        let snapshot = limiter.status(EndpointClass::Read).await.unwrap();
        assert_eq!(snapshot.daily_limit, 50);
        assert_eq!(snapshot.consumed_today, 45);
        assert_eq!(snapshot.remaining, 5);
    }

    #[tokio::test]
    async fn provider_reset_instant_wins_while_in_future() {
        let limiter = limiter(10);
        let reset_at = Utc::now() + chrono::Duration::minutes(7);
        let meta = RateMeta {
            remaining: Some(3),
            reset_at: Some(reset_at),
            ..Default::default()
        };
        limiter.observe(EndpointClass::Read, &meta).await.unwrap();

        let snapshot = limiter.status(EndpointClass::Read).await.unwrap();
        assert_eq!(snapshot.reset_at, reset_at);
    }

    #[tokio::test]
    async fn reset_clears_consumption_and_overrides() {
        let limiter = limiter(10);
        limiter.consume(EndpointClass::Read, 4).await.unwrap();
        let meta = RateMeta {
            limit: Some(5),
            ..Default::default()
        };
        limiter.observe(EndpointClass::Read, &meta).await.unwrap();

        limiter.reset(EndpointClass::Read).await.unwrap();
        let snapshot = limiter.status(EndpointClass::Read).await.unwrap();
        assert_eq!(snapshot.consumed_today, 0);
        assert_eq!(snapshot.daily_limit, 10);
    }

    #[test]
    fn wait_duration_doubles_and_caps() {
        let config = RateLimiterConfig {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), config);

        assert_eq!(limiter.wait_duration(1), Duration::from_secs(2));
        assert_eq!(limiter.wait_duration(2), Duration::from_secs(4));
        assert_eq!(limiter.wait_duration(3), Duration::from_secs(8));
        assert_eq!(limiter.wait_duration(10), Duration::from_secs(60));
    }

    #[test]
    fn wait_duration_jitter_stays_in_band() {
        let config = RateLimiterConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), config);

        for _ in 0..50 {
            let wait = limiter.wait_duration(1);
            assert!(wait >= Duration::from_secs(8), "wait {wait:?} below band");
            assert!(wait <= Duration::from_secs(12), "wait {wait:?} above band");
        }
    }
}
