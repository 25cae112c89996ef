//! Remote CRM client seam.
//!
//! The sync driver never talks to the wire directly: it consumes this trait
//! and leaves request building, authentication, and header parsing to the
//! implementation. The crate ships [`crate::jsonl::JsonlCrmClient`] for
//! rehearsal runs and [`crate::testing::MockCrmClient`] for tests; a real
//! deployment plugs its HTTP client in here.

use async_trait::async_trait;
use resilience::ProbeTransport;
use std::sync::Arc;
use sync_core::{ApiError, EntityType, RateMeta, Record, SortMode};

/// One page fetch, as issued by the sync driver.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub entity_type: EntityType,
    /// Opaque continuation token from the previous page, if any.
    pub cursor: Option<String>,
    pub page_size: usize,
    pub sort: SortMode,
}

/// One fetched page with its continuation token and response metadata.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub records: Vec<Record>,
    /// Token for the next page; `None` means the collection is exhausted.
    pub next_cursor: Option<String>,
    pub meta: RateMeta,
}

impl FetchedPage {
    pub fn empty() -> Self {
        FetchedPage {
            records: Vec::new(),
            next_cursor: None,
            meta: RateMeta::default(),
        }
    }
}

/// Remote CRM API surface the sync layer consumes.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage, ApiError>;

    /// Lightweight availability call used by the health probe.
    async fn ping(&self) -> Result<(), ApiError>;
}

/// Adapter exposing a [`CrmClient`] as the health probe's transport.
pub struct ClientProbe {
    client: Arc<dyn CrmClient>,
}

impl ClientProbe {
    pub fn new(client: Arc<dyn CrmClient>) -> Self {
        ClientProbe { client }
    }
}

#[async_trait]
impl ProbeTransport for ClientProbe {
    async fn ping(&self) -> anyhow::Result<()> {
        self.client.ping().await.map_err(anyhow::Error::from)
    }
}
