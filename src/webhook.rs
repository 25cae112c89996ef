//! Webhook event application.
//!
//! Change notifications arrive as create/update/delete/merge events on the
//! same entities the sync driver pulls. Applying one goes through the same
//! per-record step the driver uses, with the same circuit and budget
//! protections, so webhook traffic and sync traffic cannot diverge in
//! behavior.
//!
//! Unrecognized event actions follow the provider's loose contract: they
//! are logged and applied with update semantics when a payload is present.
//! Operators who prefer strictness set `reject_unknown_events` and get a
//! validation failure instead.

use crate::merge_window::MergeWindow;
use crate::migrator::MergeRelationMigrator;
use crate::processor::RecordProcessor;
use crate::result::SyncResult;
use crate::store::EntityStore;
use crate::sync::circuit_to_classified;
use chrono::{DateTime, Utc};
use resilience::{
    CircuitBreaker, ClassifiedError, EndpointClass, ErrorKind, RateLimitError, RateLimiter,
};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{DeleteOutcome, EntityType, MergeDetection, MergeStrategy, Record, RemoteId};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Operation kind under which webhook application is circuit-tracked.
pub const WEBHOOK_OP: &str = "webhook";

/// Change kind carried by a webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    Added,
    Updated,
    Deleted,
    Merged {
        merged_id: RemoteId,
        surviving_id: RemoteId,
    },
    /// Anything the parser did not recognize; the original action string is
    /// kept for logging.
    Unknown(String),
}

/// One parsed change notification.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub entity_type: EntityType,
    pub action: WebhookAction,
    pub record: Option<Record>,
    pub record_id: Option<RemoteId>,
    /// Groups events belonging to one provider-side operation; heuristic
    /// merge detection is windowed per correlation id.
    pub correlation_id: String,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Parse an event from its wire JSON.
    ///
    /// Expected shape: `{"entity": "...", "action": "...", "record": {...},
    /// "record_id": N, "merged_id": N, "surviving_id": N,
    /// "correlation_id": "...", "received_at": "..."}` with most fields
    /// optional depending on the action.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ClassifiedError> {
        let entity_type: EntityType = value
            .get("entity")
            .or_else(|| value.get("entity_type"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClassifiedError::validation("event has no entity type"))?
            .parse()
            .map_err(|err| ClassifiedError::validation(format!("{err}")))?;

        let action_name = value
            .get("action")
            .or_else(|| value.get("event"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClassifiedError::validation("event has no action"))?;

        let record = match value.get("record").or_else(|| value.get("current")) {
            Some(raw) if !raw.is_null() => Some(
                Record::from_json(raw)
                    .map_err(|err| ClassifiedError::validation(format!("{err}")))?,
            ),
            _ => None,
        };

        let record_id = value
            .get("record_id")
            .and_then(|v| v.as_i64())
            .or_else(|| record.as_ref().map(|r| r.id));

        let action = match action_name.to_ascii_lowercase().as_str() {
            "added" | "create" | "created" => WebhookAction::Added,
            "updated" | "update" | "change" => WebhookAction::Updated,
            "deleted" | "delete" => WebhookAction::Deleted,
            "merged" | "merge" => {
                let merged_id = value
                    .get("merged_id")
                    .and_then(|v| v.as_i64())
                    .or(record_id)
                    .ok_or_else(|| ClassifiedError::validation("merge event has no merged_id"))?;
                let surviving_id = value
                    .get("surviving_id")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        ClassifiedError::validation("merge event has no surviving_id")
                    })?;
                WebhookAction::Merged {
                    merged_id,
                    surviving_id,
                }
            }
            other => WebhookAction::Unknown(other.to_string()),
        };

        let correlation_id = value
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let received_at = value
            .get("received_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(WebhookEvent {
            entity_type,
            action,
            record,
            record_id,
            correlation_id,
            received_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebhookOptions {
    /// Turn unrecognized event actions into validation failures instead of
    /// applying them with update semantics.
    pub reject_unknown_events: bool,
    /// Conflict strategy used for merge migrations.
    pub merge_strategy: MergeStrategy,
    /// Rolling window for heuristic merge detection.
    pub window_ttl: Duration,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        WebhookOptions {
            reject_unknown_events: false,
            merge_strategy: MergeStrategy::KeepBoth,
            window_ttl: Duration::from_secs(30),
        }
    }
}

pub struct WebhookProcessor {
    processor: RecordProcessor,
    store: Arc<dyn EntityStore>,
    migrator: MergeRelationMigrator,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    options: WebhookOptions,
    window: Mutex<MergeWindow>,
}

impl WebhookProcessor {
    pub fn new(
        processor: RecordProcessor,
        store: Arc<dyn EntityStore>,
        migrator: MergeRelationMigrator,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        options: WebhookOptions,
    ) -> Self {
        let window = MergeWindow::new(options.window_ttl);
        WebhookProcessor {
            processor,
            store,
            migrator,
            limiter,
            breaker,
            options,
            window: Mutex::new(window),
        }
    }

    /// Apply one change notification. Always returns a structured result.
    pub async fn apply(&self, event: WebhookEvent) -> SyncResult {
        let mut result = SyncResult::started(event.entity_type);

        if let Err(err) = self.breaker.guard(WEBHOOK_OP).await {
            result.fail(&circuit_to_classified(err));
            return self.finish(result).await;
        }

        if let Err(err) = self.limiter.consume(EndpointClass::Write, 1).await {
            let classified = match err {
                RateLimitError::Exhausted { retry_in, .. } => ClassifiedError {
                    kind: ErrorKind::RateLimit,
                    retryable: true,
                    retry_after: Some(retry_in.min(Duration::from_secs(300))),
                    max_retries: 3,
                    message: "write budget exhausted, reschedule event".into(),
                },
                RateLimitError::Store(err) => {
                    ClassifiedError::generic(format!("rate budget store failed: {err}"))
                }
            };
            result.fail(&classified);
            return self.finish(result).await;
        }

        match self.dispatch(&event, &mut result).await {
            Ok(()) => {
                if let Err(err) = self.breaker.record_success(WEBHOOK_OP).await {
                    tracing::debug!(error = %err, "could not record circuit success");
                }
            }
            Err(err) => {
                if let Err(store_err) = self.breaker.record_failure(WEBHOOK_OP).await {
                    tracing::debug!(error = %store_err, "could not record circuit failure");
                }
                result.fail(&err);
            }
        }

        self.finish(result).await
    }

    async fn dispatch(
        &self,
        event: &WebhookEvent,
        result: &mut SyncResult,
    ) -> Result<(), ClassifiedError> {
        match &event.action {
            WebhookAction::Added | WebhookAction::Updated => self.apply_update(event, result).await,

            WebhookAction::Deleted => self.apply_delete(event, result).await,

            WebhookAction::Merged {
                merged_id,
                surviving_id,
            } => {
                self.run_migration(event.entity_type, *merged_id, *surviving_id, result)
                    .await?;
                // Update semantics for the survivor when the event carried
                // its payload.
                if event.record.is_some() {
                    self.apply_update(event, result).await?;
                }
                Ok(())
            }

            WebhookAction::Unknown(name) => {
                if self.options.reject_unknown_events {
                    return Err(ClassifiedError::validation(format!(
                        "unrecognized event action '{name}'"
                    )));
                }
                tracing::warn!(
                    action = name.as_str(),
                    entity_type = %event.entity_type,
                    "unrecognized event action, applying update semantics"
                );
                self.apply_update(event, result).await
            }
        }
    }

    async fn apply_update(
        &self,
        event: &WebhookEvent,
        result: &mut SyncResult,
    ) -> Result<(), ClassifiedError> {
        let record = event
            .record
            .as_ref()
            .ok_or_else(|| ClassifiedError::validation("event has no record payload"))?;

        // Route the payload as a one-record page through the shared step.
        let stats = self
            .processor
            .process(event.entity_type, std::slice::from_ref(record))
            .await;
        result.synced += stats.synced;
        result.updated += stats.updated;
        result.skipped += stats.skipped;
        result.errors += stats.errors;

        let mut window = self.window.lock().await;
        window.note_update(
            &event.correlation_id,
            event.entity_type,
            record.id,
            event.received_at,
        );
        Ok(())
    }

    async fn apply_delete(
        &self,
        event: &WebhookEvent,
        result: &mut SyncResult,
    ) -> Result<(), ClassifiedError> {
        let id = event
            .record_id
            .ok_or_else(|| ClassifiedError::validation("delete event has no record id"))?;

        match self.store.delete(event.entity_type, id).await {
            Ok(DeleteOutcome::Deleted) => result.synced += 1,
            Ok(DeleteOutcome::NotFound) => result.skipped += 1,
            Err(err) => {
                result.errors += 1;
                tracing::warn!(record_id = id, error = %err, "delete failed");
            }
        }

        // A delete can complete a merge pattern in the window.
        let inferred = {
            let mut window = self.window.lock().await;
            window.note_delete(&event.correlation_id, event.entity_type, id, event.received_at);
            let merge = window.detect(&event.correlation_id);
            if merge.is_some() {
                window.clear(&event.correlation_id);
            }
            merge
        };

        if let Some(merge) = inferred {
            debug_assert_eq!(merge.detected_via, MergeDetection::Heuristic);
            tracing::info!(
                entity_type = %merge.entity_type,
                merged_id = merge.merged_id,
                surviving_id = merge.surviving_id,
                "inferred merge from correlated update/delete pattern"
            );
            self.run_migration(merge.entity_type, merge.merged_id, merge.surviving_id, result)
                .await?;
        }
        Ok(())
    }

    async fn run_migration(
        &self,
        entity_type: EntityType,
        merged_id: RemoteId,
        surviving_id: RemoteId,
        result: &mut SyncResult,
    ) -> Result<(), ClassifiedError> {
        let report = self
            .migrator
            .migrate(entity_type, merged_id, surviving_id, self.options.merge_strategy)
            .await
            .map_err(|err| ClassifiedError::generic(format!("relation migration failed: {err}")))?;
        result.errors += report.errors;
        Ok(())
    }

    async fn finish(&self, mut result: SyncResult) -> SyncResult {
        result.completed_at = Some(Utc::now());
        result.rate = self.limiter.status(EndpointClass::Write).await.ok();
        tracing::info!(
            entity_type = %result.entity_type,
            synced = result.synced,
            errors = result.errors,
            success = result.is_success(),
            "webhook event applied"
        );
        result
    }
}
