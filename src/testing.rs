//! Test infrastructure shared by unit and integration tests.
//!
//! Ships a scripted CRM client, record builders, and a service constructor
//! wired with in-memory collaborators and a fixed memory sampler, so tests
//! exercise the full pipeline deterministically without a network.

use crate::client::{CrmClient, FetchedPage, PageRequest};
use crate::service::{ServiceConfig, SyncService};
use crate::store::MemoryStore;
use async_trait::async_trait;
use resilience::{FixedSampler, MemoryCounterStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_core::{ApiError, ConnectKind, RateMeta, Record, RemoteId};
use tokio::sync::Mutex;

/// CRM client that replays a scripted sequence of page results.
///
/// Each `fetch_page` pops the next scripted outcome; an empty script yields
/// empty pages. Issued requests are recorded for assertions on page sizes
/// and cursors.
#[derive(Default)]
pub struct MockCrmClient {
    script: Mutex<VecDeque<Result<FetchedPage, ApiError>>>,
    requests: Mutex<Vec<PageRequest>>,
    ping_fails: AtomicBool,
}

impl MockCrmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_page(&self, records: Vec<Record>, next_cursor: Option<&str>) {
        self.push_page_with_meta(records, next_cursor, RateMeta::default())
            .await;
    }

    pub async fn push_page_with_meta(
        &self,
        records: Vec<Record>,
        next_cursor: Option<&str>,
        meta: RateMeta,
    ) {
        self.script.lock().await.push_back(Ok(FetchedPage {
            records,
            next_cursor: next_cursor.map(str::to_string),
            meta,
        }));
    }

    pub async fn push_error(&self, error: ApiError) {
        self.script.lock().await.push_back(Err(error));
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    /// Requests issued so far, in order.
    pub async fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn fetch_calls(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl CrmClient for MockCrmClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage, ApiError> {
        self.requests.lock().await.push(request.clone());
        match self.script.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => Ok(FetchedPage::empty()),
        }
    }

    async fn ping(&self) -> Result<(), ApiError> {
        if self.ping_fails.load(Ordering::SeqCst) {
            Err(ApiError::Connect(ConnectKind::Refused))
        } else {
            Ok(())
        }
    }
}

/// A record with one marker field derived from its id.
pub fn record(id: RemoteId) -> Record {
    let mut fields = serde_json::Map::new();
    fields.insert("id".into(), serde_json::Value::from(id));
    fields.insert(
        "title".into(),
        serde_json::Value::String(format!("record-{id}")),
    );
    Record::new(id, fields)
}

/// Records for a contiguous id range, e.g. `records(1..=500)`.
pub fn records(range: std::ops::RangeInclusive<RemoteId>) -> Vec<Record> {
    range.map(record).collect()
}

/// Everything a pipeline test needs, pre-wired with in-memory backends.
pub struct TestHarness {
    pub client: Arc<MockCrmClient>,
    pub store: Arc<MemoryStore>,
    pub service: SyncService,
}

/// Build a service over in-memory collaborators with a fixed memory usage
/// ratio and the given component configuration.
pub fn harness_with(mut config: ServiceConfig, usage_ratio: f64) -> TestHarness {
    let client = Arc::new(MockCrmClient::new());
    let store = Arc::new(MemoryStore::new());
    config.memory_sampler = Some(Box::new(FixedSampler::new(usage_ratio)));
    let service = SyncService::new(
        client.clone(),
        store.clone(),
        store.clone(),
        Arc::new(MemoryCounterStore::new()),
        config,
    );
    TestHarness {
        client,
        store,
        service,
    }
}

/// Harness with default configuration and relaxed memory.
pub fn harness() -> TestHarness {
    harness_with(ServiceConfig::default(), 0.30)
}
