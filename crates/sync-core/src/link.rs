//! Relationship records between host-application objects and CRM entities,
//! and the merge types consumed by the relation migrator.

use crate::types::{EntityType, RemoteId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The host-application side of a relationship, e.g. an order or an invoice
/// that is linked to a CRM entity. The migrator never creates or mutates the
/// owner itself, only the link rows pointing from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkOwner {
    /// Owner kind, e.g. "order" or "invoice".
    pub kind: String,
    /// Owner key within its kind, e.g. "Order#123".
    pub key: String,
}

impl LinkOwner {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        LinkOwner {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for LinkOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Synchronization state of one link row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkSyncStatus {
    Pending,
    #[default]
    Synced,
    Error,
}

/// One relationship row pointing from a host-application owner at a CRM
/// entity. Rows are identified by a local id so that two rows from the same
/// owner to the same entity can coexist after a keep-both merge migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    pub id: Uuid,
    pub owner: LinkOwner,
    pub entity_type: EntityType,
    pub entity_id: RemoteId,
    pub is_primary: bool,
    pub sync_status: LinkSyncStatus,
    /// Provenance marker set when a merge migration rewrote this row away
    /// from a retired entity id.
    pub migrated_from: Option<RemoteId>,
}

impl EntityLink {
    pub fn new(owner: LinkOwner, entity_type: EntityType, entity_id: RemoteId) -> Self {
        EntityLink {
            id: Uuid::new_v4(),
            owner,
            entity_type,
            entity_id,
            is_primary: false,
            sync_status: LinkSyncStatus::default(),
            migrated_from: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

/// Conflict resolution applied when a merge migration finds that the owner
/// of a migrating link already holds a link to the surviving entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Rewrite the migrating link to the survivor but demote it; both rows
    /// remain.
    KeepBoth,
    /// Discard the migrating link; the pre-existing one wins.
    KeepSurviving,
    /// Rewrite the migrating link and discard the pre-existing one.
    KeepMerged,
}

impl std::str::FromStr for MergeStrategy {
    type Err = crate::types::TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep_both" | "keep-both" => Ok(MergeStrategy::KeepBoth),
            "keep_surviving" | "keep-surviving" => Ok(MergeStrategy::KeepSurviving),
            "keep_merged" | "keep-merged" => Ok(MergeStrategy::KeepMerged),
            other => Err(crate::types::TypeParseError(format!(
                "unknown merge strategy: {other}"
            ))),
        }
    }
}

/// How a merge was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeDetection {
    /// The provider sent an explicit merge event.
    Explicit,
    /// Inferred from a correlated update/delete pattern in the webhook
    /// stream.
    Heuristic,
}

/// A recognized entity merge: `merged_id` was retired in favor of
/// `surviving_id`. Consumed immediately by the relation migrator, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub entity_type: EntityType,
    pub merged_id: RemoteId,
    pub surviving_id: RemoteId,
    pub detected_via: MergeDetection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_strategy_parses_both_separators() {
        assert_eq!(
            "keep_both".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::KeepBoth
        );
        assert_eq!(
            "keep-surviving".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::KeepSurviving
        );
        assert!("keep_everything".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn new_links_get_distinct_ids() {
        let owner = LinkOwner::new("order", "Order#1");
        let a = EntityLink::new(owner.clone(), EntityType::Organizations, 6);
        let b = EntityLink::new(owner, EntityType::Organizations, 6);
        assert_ne!(a.id, b.id);
        assert!(!a.is_primary);
        assert!(b.primary().is_primary);
    }
}
