//! Local storage seams and the in-memory backend.
//!
//! Persistence mapping is the host application's concern; the sync layer
//! only needs upsert/delete/lookup over entities and link-row operations
//! for the merge migrator. [`MemoryStore`] implements both seams for the
//! CLI's rehearsal mode and for tests, including per-record failure
//! injection so partial-failure paths can be exercised.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{
    ApiError, DeleteOutcome, EntityLink, EntityType, LinkOwner, Record, RemoteId, UpsertOutcome,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Entity persistence operations the sync layer delegates to.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert(&self, entity_type: EntityType, record: &Record)
        -> anyhow::Result<UpsertOutcome>;

    async fn delete(&self, entity_type: EntityType, id: RemoteId)
        -> anyhow::Result<DeleteOutcome>;

    async fn get(&self, entity_type: EntityType, id: RemoteId) -> anyhow::Result<Option<Record>>;

    async fn count(&self, entity_type: EntityType) -> anyhow::Result<usize>;
}

/// Link-row operations the merge migrator delegates to.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// All link rows pointing at the given entity.
    async fn links_to(
        &self,
        entity_type: EntityType,
        entity_id: RemoteId,
    ) -> anyhow::Result<Vec<EntityLink>>;

    /// Insert or overwrite a link row by its id.
    async fn put_link(&self, link: EntityLink) -> anyhow::Result<()>;

    /// Remove a link row by its id. Absent rows are a no-op.
    async fn remove_link(&self, link_id: Uuid) -> anyhow::Result<()>;
}

/// In-memory entity and link storage.
#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<(EntityType, RemoteId), Record>>,
    links: Mutex<HashMap<Uuid, EntityLink>>,
    /// Remote ids whose upserts always fail, with the error to report.
    failing: Mutex<HashMap<RemoteId, FailureMode>>,
}

#[derive(Clone)]
enum FailureMode {
    Always(Arc<ApiError>),
    /// Fail the next `n` attempts, then succeed.
    Transient(Arc<ApiError>, u32),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert of `id` fail with `error`.
    pub async fn fail_record(&self, id: RemoteId, error: ApiError) {
        self.failing
            .lock()
            .await
            .insert(id, FailureMode::Always(Arc::new(error)));
    }

    /// Make the next `times` upserts of `id` fail with `error`, then recover.
    pub async fn fail_record_times(&self, id: RemoteId, error: ApiError, times: u32) {
        self.failing
            .lock()
            .await
            .insert(id, FailureMode::Transient(Arc::new(error), times));
    }

    pub async fn insert_link(&self, link: EntityLink) {
        self.links.lock().await.insert(link.id, link);
    }

    pub async fn links_for_owner(&self, owner: &LinkOwner) -> Vec<EntityLink> {
        self.links
            .lock()
            .await
            .values()
            .filter(|l| &l.owner == owner)
            .cloned()
            .collect()
    }

    async fn take_failure(&self, id: RemoteId) -> Option<ApiError> {
        let mut failing = self.failing.lock().await;
        match failing.get_mut(&id)? {
            FailureMode::Always(err) => Some((**err).clone()),
            FailureMode::Transient(err, left) => {
                if *left == 0 {
                    failing.remove(&id);
                    return None;
                }
                *left -= 1;
                let err = (**err).clone();
                if *left == 0 {
                    failing.remove(&id);
                }
                Some(err)
            }
        }
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert(
        &self,
        entity_type: EntityType,
        record: &Record,
    ) -> anyhow::Result<UpsertOutcome> {
        if let Some(err) = self.take_failure(record.id).await {
            return Err(err.into());
        }

        let mut entities = self.entities.lock().await;
        match entities.insert((entity_type, record.id), record.clone()) {
            None => Ok(UpsertOutcome::Created),
            Some(previous) if previous.fields == record.fields => Ok(UpsertOutcome::Skipped),
            Some(_) => Ok(UpsertOutcome::Updated),
        }
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: RemoteId,
    ) -> anyhow::Result<DeleteOutcome> {
        let mut entities = self.entities.lock().await;
        match entities.remove(&(entity_type, id)) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn get(&self, entity_type: EntityType, id: RemoteId) -> anyhow::Result<Option<Record>> {
        Ok(self.entities.lock().await.get(&(entity_type, id)).cloned())
    }

    async fn count(&self, entity_type: EntityType) -> anyhow::Result<usize> {
        Ok(self
            .entities
            .lock()
            .await
            .keys()
            .filter(|(et, _)| *et == entity_type)
            .count())
    }
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn links_to(
        &self,
        entity_type: EntityType,
        entity_id: RemoteId,
    ) -> anyhow::Result<Vec<EntityLink>> {
        let links = self.links.lock().await;
        let mut matching: Vec<EntityLink> = links
            .values()
            .filter(|l| l.entity_type == entity_type && l.entity_id == entity_id)
            .cloned()
            .collect();
        // Deterministic order for callers that iterate and mutate.
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }

    async fn put_link(&self, link: EntityLink) -> anyhow::Result<()> {
        self.links.lock().await.insert(link.id, link);
        Ok(())
    }

    async fn remove_link(&self, link_id: Uuid) -> anyhow::Result<()> {
        self.links.lock().await.remove(&link_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RemoteId, title: &str) -> Record {
        let mut fields = serde_json::Map::new();
        fields.insert("title".into(), serde_json::Value::String(title.into()));
        Record::new(id, fields)
    }

    #[tokio::test]
    async fn upsert_distinguishes_created_updated_skipped() {
        let store = MemoryStore::new();
        let first = store
            .upsert(EntityType::Deals, &record(1, "a"))
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Created);

        let same = store
            .upsert(EntityType::Deals, &record(1, "a"))
            .await
            .unwrap();
        assert_eq!(same, UpsertOutcome::Skipped);

        let changed = store
            .upsert(EntityType::Deals, &record(1, "b"))
            .await
            .unwrap();
        assert_eq!(changed, UpsertOutcome::Updated);
        assert_eq!(store.count(EntityType::Deals).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store
            .upsert(EntityType::Persons, &record(9, "x"))
            .await
            .unwrap();

        assert_eq!(
            store.delete(EntityType::Persons, 9).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete(EntityType::Persons, 9).await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn transient_failures_recover() {
        let store = MemoryStore::new();
        store
            .fail_record_times(
                5,
                ApiError::Server {
                    status: 503,
                    message: "unavailable".into(),
                },
                2,
            )
            .await;

        assert!(store.upsert(EntityType::Deals, &record(5, "a")).await.is_err());
        assert!(store.upsert(EntityType::Deals, &record(5, "a")).await.is_err());
        assert!(store.upsert(EntityType::Deals, &record(5, "a")).await.is_ok());
    }

    #[tokio::test]
    async fn links_query_by_target() {
        let store = MemoryStore::new();
        let owner = LinkOwner::new("order", "Order#123");
        store
            .insert_link(EntityLink::new(owner.clone(), EntityType::Organizations, 6).primary())
            .await;
        store
            .insert_link(EntityLink::new(owner.clone(), EntityType::Organizations, 7))
            .await;

        let to_six = store.links_to(EntityType::Organizations, 6).await.unwrap();
        assert_eq!(to_six.len(), 1);
        assert!(to_six[0].is_primary);
        assert_eq!(store.links_for_owner(&owner).await.len(), 2);
    }
}
