//! crm-sync Library
//!
//! A resilient synchronization layer for rate-limited CRM APIs: pulls
//! paginated resources into local storage and applies webhook change
//! notifications, protecting itself from rate-limit exhaustion, unreliable
//! upstreams, and local memory pressure.
//!
//! # Features
//!
//! - Paginated full and incremental sync with strict page ordering
//! - Daily token budgets per endpoint class with provider-header overrides
//! - Error classification with per-kind retry policy and circuit breaking
//! - Adaptive page sizing under memory pressure
//! - Upstream health probing with a cached verdict
//! - Webhook application with entity-merge relation migration, including
//!   heuristic merge detection from correlated update/delete patterns
//!
//! # Architecture
//!
//! The resilience components live in the `resilience` crate and shared
//! types in `sync-core`; this crate owns orchestration:
//!
//! - [`SyncDriver`] - the paginated fetch/process loop for one entity type
//! - [`WebhookProcessor`] - applies one change event through the same
//!   per-record step
//! - [`MergeRelationMigrator`] - rewrites link rows after entity merges
//! - [`SyncWorker`] - queued execution with classifier-driven retries
//! - [`SyncService`] - wires everything and exposes the operator surface
//!
//! Collaborators are traits: [`CrmClient`] for the wire, [`EntityStore`] /
//! [`LinkStore`] for persistence, and `resilience::CounterStore` for shared
//! rate/circuit state. The crate ships an in-memory store, a JSONL-backed
//! client for offline rehearsals, and scripted test doubles in
//! [`testing`].
//!
//! # CLI Usage
//!
//! ```bash
//! # Full sync of deals from an exported dataset
//! crm-sync sync full deals --source-dir ./export
//!
//! # Incremental sync, deferring instead of blocking on rate budget
//! crm-sync sync incremental deals --source-dir ./export --deferred
//!
//! # Apply a webhook event from a file
//! crm-sync webhook --source-dir ./export --event event.json
//!
//! # Component status as JSON
//! crm-sync status --source-dir ./export
//! ```

pub mod client;
pub mod config;
pub mod jsonl;
pub mod merge_window;
pub mod migrator;
pub mod processor;
pub mod result;
pub mod service;
pub mod store;
pub mod sync;
pub mod testing;
pub mod webhook;
pub mod worker;

pub use client::{ClientProbe, CrmClient, FetchedPage, PageRequest};
pub use config::{parse_duration, BudgetOpts, SyncOpts};
pub use jsonl::JsonlCrmClient;
pub use merge_window::MergeWindow;
pub use migrator::{MergeRelationMigrator, MigrationReport};
pub use processor::{ProcessStats, RecordProcessor};
pub use result::{RunFailure, SyncResult};
pub use service::{ResetTarget, ServiceConfig, StatusReport, SyncService};
pub use store::{EntityStore, LinkStore, MemoryStore};
pub use sync::{ExecutionMode, SyncDriver, SyncOptions, SYNC_OP};
pub use webhook::{WebhookAction, WebhookEvent, WebhookOptions, WebhookProcessor, WEBHOOK_OP};
pub use worker::{JobHandle, SyncWorker};
