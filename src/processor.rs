//! Per-record processing shared by the sync driver and the webhook
//! processor.
//!
//! Each record is upserted through the entity store with partial-failure
//! isolation: a non-retryable failure is tallied and processing moves on to
//! the next record, a retryable one is retried inline within the
//! classifier's budget before being tallied. A failing record never aborts
//! the page.

use crate::store::EntityStore;
use resilience::{classify, ClassifiedError};
use std::sync::Arc;
use sync_core::{ApiError, EntityType, Record, UpsertOutcome};

/// Counts from one processed batch of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub synced: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Clone)]
pub struct RecordProcessor {
    store: Arc<dyn EntityStore>,
}

impl RecordProcessor {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        RecordProcessor { store }
    }

    /// Apply a batch of records, isolating per-record failures.
    pub async fn process(&self, entity_type: EntityType, records: &[Record]) -> ProcessStats {
        let mut stats = ProcessStats::default();
        for record in records {
            match self.apply_one(entity_type, record).await {
                Ok(UpsertOutcome::Created) => stats.synced += 1,
                Ok(UpsertOutcome::Updated) => {
                    stats.synced += 1;
                    stats.updated += 1;
                }
                Ok(UpsertOutcome::Skipped) => stats.skipped += 1,
                Err(err) => {
                    stats.errors += 1;
                    tracing::warn!(
                        entity_type = %entity_type,
                        record_id = record.id,
                        kind = %err.kind,
                        error = %err,
                        "record failed, continuing with next"
                    );
                }
            }
        }
        stats
    }

    /// Upsert one record, retrying inline within the classifier's budget.
    async fn apply_one(
        &self,
        entity_type: EntityType,
        record: &Record,
    ) -> Result<UpsertOutcome, ClassifiedError> {
        let mut attempt = 1u32;
        loop {
            match self.store.upsert(entity_type, record).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let classified = match err.downcast_ref::<ApiError>() {
                        Some(api) => classify(api),
                        None => ClassifiedError::generic(err.to_string()),
                    };
                    if !classified.should_retry(attempt) {
                        return Err(classified);
                    }
                    let delay = classified.retry_delay(attempt);
                    tracing::debug!(
                        record_id = record.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying record after classified failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
