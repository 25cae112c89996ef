//! Structured sync outcomes.
//!
//! Every run and every webhook application returns a [`SyncResult`],
//! whether it succeeded, partially succeeded, or failed: counts, timing,
//! and snapshots of the rate/memory/health state at completion. Nothing is
//! silently dropped.

use chrono::{DateTime, Utc};
use resilience::{ClassifiedError, ErrorKind, HealthSnapshot, MemoryStats, RateSnapshot};
use serde::Serialize;
use sync_core::EntityType;

/// A run-level failure, flattened for serialization and for the worker
/// queue's retry decision.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub max_retries: u32,
}

impl From<&ClassifiedError> for RunFailure {
    fn from(err: &ClassifiedError) -> Self {
        RunFailure {
            kind: err.kind,
            message: err.message.clone(),
            retryable: err.retryable,
            retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
            max_retries: err.max_retries,
        }
    }
}

/// Aggregated outcome of one sync run or webhook application.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub entity_type: EntityType,
    /// Records applied to local storage (created + updated).
    pub synced: u64,
    /// Subset of `synced` that updated an existing record.
    pub updated: u64,
    /// Records whose stored state already matched.
    pub skipped: u64,
    /// Records that failed past their retry budget.
    pub errors: u64,
    pub pages_fetched: u32,
    /// Attempts the most recently fetched page needed (1 = first try).
    pub last_fetch_attempts: u32,
    /// Set when an asynchronous run gave up its slot instead of blocking on
    /// rate budget; the scheduler is expected to retry later.
    pub deferred: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
    pub rate: Option<RateSnapshot>,
    pub memory: Option<MemoryStats>,
    pub health: Option<HealthSnapshot>,
}

impl SyncResult {
    pub fn started(entity_type: EntityType) -> Self {
        SyncResult {
            entity_type,
            synced: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            pages_fetched: 0,
            last_fetch_attempts: 0,
            deferred: false,
            started_at: Utc::now(),
            completed_at: None,
            failure: None,
            rate: None,
            memory: None,
            health: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Record a run-level failure. The first failure wins; later ones are
    /// kept out so the original cause survives aggregation.
    pub fn fail(&mut self, err: &ClassifiedError) {
        if self.failure.is_none() {
            self.failure = Some(RunFailure::from(err));
        }
    }

    /// Fold counts from another (sub-batch) result into this one.
    pub fn merge(&mut self, other: &SyncResult) {
        self.synced += other.synced;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.pages_fetched += other.pages_fetched;
        self.last_fetch_attempts = self.last_fetch_attempts.max(other.last_fetch_attempts);
        self.deferred |= other.deferred;
        if self.failure.is_none() {
            self.failure = other.failure.clone();
        }
        if let Some(completed) = other.completed_at {
            self.completed_at = Some(self.completed_at.map_or(completed, |c| c.max(completed)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_counts_and_keeps_first_failure() {
        let mut a = SyncResult::started(EntityType::Deals);
        a.synced = 10;
        a.errors = 1;
        a.pages_fetched = 2;
        a.last_fetch_attempts = 1;

        let mut b = SyncResult::started(EntityType::Deals);
        b.synced = 5;
        b.updated = 2;
        b.pages_fetched = 1;
        b.last_fetch_attempts = 3;
        b.deferred = true;
        b.completed_at = Some(Utc::now());
        b.fail(&ClassifiedError::validation("bad page size"));

        a.merge(&b);
        assert_eq!(a.synced, 15);
        assert_eq!(a.updated, 2);
        assert_eq!(a.errors, 1);
        assert_eq!(a.pages_fetched, 3);
        assert_eq!(a.last_fetch_attempts, 3);
        assert!(a.deferred);
        assert!(a.completed_at.is_some());
        assert_eq!(a.failure.as_ref().unwrap().kind, ErrorKind::Validation);

        // A later failure does not displace the recorded one.
        a.fail(&ClassifiedError::generic("other"));
        assert_eq!(a.failure.unwrap().kind, ErrorKind::Validation);
    }

    #[test]
    fn result_serializes_for_operators() {
        let mut result = SyncResult::started(EntityType::Organizations);
        result.synced = 3;
        result.completed_at = Some(Utc::now());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["entity_type"], "organizations");
        assert_eq!(json["synced"], 3);
        assert_eq!(json["deferred"], false);
    }
}
