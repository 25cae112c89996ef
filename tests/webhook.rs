//! Webhook application and merge handling tests.

use crm_sync::testing::{harness, harness_with, record};
use crm_sync::{EntityStore, ServiceConfig, WebhookEvent};
use resilience::{CircuitBreakerConfig, ErrorKind, RateLimiterConfig};
use std::time::Duration;
use sync_core::{EntityLink, EntityType, LinkOwner};

fn event(value: serde_json::Value) -> WebhookEvent {
    WebhookEvent::from_json(&value).expect("valid event")
}

#[tokio::test(start_paused = true)]
async fn added_event_upserts_the_payload() {
    let h = harness();
    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "deals",
            "action": "added",
            "record": {"id": 42, "title": "New deal"},
        })))
        .await;

    assert!(result.is_success(), "failure: {:?}", result.failure);
    assert_eq!(result.synced, 1);
    assert!(h
        .store
        .get(EntityType::Deals, 42)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn delete_event_is_idempotent() {
    let h = harness();
    h.store
        .upsert(EntityType::Persons, &record(9))
        .await
        .unwrap();

    let delete = serde_json::json!({
        "entity": "persons",
        "action": "deleted",
        "record_id": 9,
    });

    let first = h.service.apply_webhook(event(delete.clone())).await;
    assert!(first.is_success());
    assert_eq!(first.synced, 1);

    // A replayed delete is a no-op, not an error.
    let second = h.service.apply_webhook(event(delete)).await;
    assert!(second.is_success());
    assert_eq!(second.skipped, 1);
    assert_eq!(second.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_action_defaults_to_update_semantics() {
    let h = harness();
    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "deals",
            "action": "relabeled",
            "record": {"id": 5, "title": "renamed"},
        })))
        .await;

    assert!(result.is_success(), "failure: {:?}", result.failure);
    assert_eq!(result.synced, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_action_without_payload_is_invalid() {
    let h = harness();
    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "deals",
            "action": "relabeled",
            "record_id": 5,
        })))
        .await;

    let failure = result.failure.expect("validation failure");
    assert_eq!(failure.kind, ErrorKind::Validation);
}

#[tokio::test(start_paused = true)]
async fn strict_mode_rejects_unknown_actions() {
    let mut config = ServiceConfig::default();
    config.webhook.reject_unknown_events = true;
    let h = harness_with(config, 0.30);

    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "deals",
            "action": "relabeled",
            "record": {"id": 5},
        })))
        .await;

    let failure = result.failure.expect("rejected event");
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert_eq!(h.store.count(EntityType::Deals).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn merge_event_migrates_links_and_updates_survivor() {
    let h = harness();
    let owner = LinkOwner::new("order", "Order#123");
    h.store
        .insert_link(EntityLink::new(owner.clone(), EntityType::Organizations, 6).primary())
        .await;
    h.store
        .insert_link(EntityLink::new(owner.clone(), EntityType::Organizations, 7).primary())
        .await;

    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "organizations",
            "action": "merged",
            "merged_id": 7,
            "surviving_id": 6,
            "record": {"id": 6, "name": "Surviving Org"},
        })))
        .await;

    assert!(result.is_success(), "failure: {:?}", result.failure);
    // Update semantics applied for the survivor.
    assert_eq!(result.synced, 1);

    // keep_both: two rows remain, both on the survivor, one demoted.
    let rows = h.store.links_for_owner(&owner).await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|l| l.entity_id == 6));
    assert_eq!(rows.iter().filter(|l| !l.is_primary).count(), 1);
    assert_eq!(
        rows.iter().filter(|l| l.migrated_from == Some(7)).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn correlated_update_delete_pattern_infers_a_merge() {
    let h = harness();
    let owner = LinkOwner::new("order", "Order#7");
    h.store
        .insert_link(EntityLink::new(owner.clone(), EntityType::Organizations, 7))
        .await;

    let updates = [
        serde_json::json!({
            "entity": "organizations",
            "action": "updated",
            "record": {"id": 6, "name": "Six"},
            "correlation_id": "corr-merge",
        }),
        serde_json::json!({
            "entity": "organizations",
            "action": "updated",
            "record": {"id": 7, "name": "Seven"},
            "correlation_id": "corr-merge",
        }),
    ];
    for update in updates {
        let result = h.service.apply_webhook(event(update)).await;
        assert!(result.is_success());
    }

    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "organizations",
            "action": "deleted",
            "record_id": 7,
            "correlation_id": "corr-merge",
        })))
        .await;
    assert!(result.is_success(), "failure: {:?}", result.failure);

    // The inferred merge rewrote the link from 7 to the survivor 6.
    let rows = h.store.links_for_owner(&owner).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].entity_id, 6);
    assert_eq!(rows[0].migrated_from, Some(7));
}

#[tokio::test(start_paused = true)]
async fn uncorrelated_delete_does_not_infer_a_merge() {
    let h = harness();
    let owner = LinkOwner::new("order", "Order#8");
    h.store
        .insert_link(EntityLink::new(owner.clone(), EntityType::Organizations, 7))
        .await;

    let result = h
        .service
        .apply_webhook(event(serde_json::json!({
            "entity": "organizations",
            "action": "deleted",
            "record_id": 7,
            "correlation_id": "corr-lonely",
        })))
        .await;
    assert!(result.is_success());

    // No merge inferred, so the link still points at the deleted entity.
    let rows = h.store.links_for_owner(&owner).await;
    assert_eq!(rows[0].entity_id, 7);
    assert!(rows[0].migrated_from.is_none());
}

#[tokio::test(start_paused = true)]
async fn exhausted_write_budget_rejects_events() {
    let config = ServiceConfig {
        rate: RateLimiterConfig {
            write_daily_limit: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness_with(config, 0.30);

    let update = serde_json::json!({
        "entity": "deals",
        "action": "updated",
        "record": {"id": 1},
    });

    let first = h.service.apply_webhook(event(update.clone())).await;
    assert!(first.is_success());

    let second = h.service.apply_webhook(event(update)).await;
    let failure = second.failure.expect("rate limited");
    assert_eq!(failure.kind, ErrorKind::RateLimit);
    assert!(failure.retryable);
}

#[tokio::test(start_paused = true)]
async fn repeated_event_failures_open_the_webhook_circuit() {
    let config = ServiceConfig {
        circuit: CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(300),
        },
        ..Default::default()
    };
    let h = harness_with(config, 0.30);

    let invalid = serde_json::json!({
        "entity": "deals",
        "action": "relabeled",
        "record_id": 1,
    });
    for _ in 0..2 {
        let result = h.service.apply_webhook(event(invalid.clone())).await;
        assert!(!result.is_success());
    }

    // Even a valid event is now rejected while the circuit cools down.
    let valid = serde_json::json!({
        "entity": "deals",
        "action": "updated",
        "record": {"id": 2},
    });
    let rejected = h.service.apply_webhook(event(valid)).await;
    let failure = rejected.failure.expect("circuit rejection");
    assert!(failure.message.contains("circuit open"));
    assert_eq!(h.store.count(EntityType::Deals).await.unwrap(), 0);
}
