//! Shared core types for crm-sync
//!
//! This crate defines the type vocabulary shared between the orchestration
//! layer and the resilience components:
//!
//! - Entity and record types ([`EntityType`], [`Record`]) describing the
//!   remote CRM collections being synchronized
//! - Paging and outcome types ([`SortMode`], [`SyncMode`], [`UpsertOutcome`],
//!   [`DeleteOutcome`]) used by the sync driver and its collaborators
//! - Relationship types ([`EntityLink`], [`LinkOwner`]) and merge handling
//!   types ([`MergeStrategy`], [`MergeEvent`]) consumed by the merge
//!   relation migrator
//! - The wire-level failure taxonomy ([`ApiError`], [`RateMeta`]) produced
//!   by CRM client implementations and consumed by the error classifier

mod api;
mod link;
mod types;

pub use api::{ApiError, ConnectKind, RateMeta};
pub use link::{EntityLink, LinkOwner, LinkSyncStatus, MergeDetection, MergeEvent, MergeStrategy};
pub use types::{
    DeleteOutcome, EntityType, Record, RemoteId, SortMode, SyncMode, TypeParseError,
    UpsertOutcome,
};
