//! Merge relation migration.
//!
//! When the provider merges two entities, link rows pointing at the retired
//! id must be rewritten to the survivor. Conflicts (the owner already holds
//! a link to the survivor) resolve by strategy, every rewritten row gets a
//! provenance marker, and per-row failures never abort the remaining
//! migrations. Running a migration twice is a no-op: the first pass leaves
//! nothing pointing at the retired id.

use crate::store::LinkStore;
use serde::Serialize;
use std::sync::Arc;
use sync_core::{EntityLink, EntityType, MergeStrategy, RemoteId};

/// Counts from one migration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub errors: u64,
}

struct RowOutcome {
    migrated: bool,
    conflict: bool,
}

#[derive(Clone)]
pub struct MergeRelationMigrator {
    links: Arc<dyn LinkStore>,
}

impl MergeRelationMigrator {
    pub fn new(links: Arc<dyn LinkStore>) -> Self {
        MergeRelationMigrator { links }
    }

    /// Rewrite every link row pointing at `merged_id` to point at
    /// `surviving_id`, resolving owner conflicts per `strategy`.
    pub async fn migrate(
        &self,
        entity_type: EntityType,
        merged_id: RemoteId,
        surviving_id: RemoteId,
        strategy: MergeStrategy,
    ) -> anyhow::Result<MigrationReport> {
        let mut report = MigrationReport::default();
        if merged_id == surviving_id {
            tracing::warn!(
                entity_type = %entity_type,
                id = merged_id,
                "merge with identical ids, nothing to migrate"
            );
            return Ok(report);
        }

        let merged_links = self.links.links_to(entity_type, merged_id).await?;
        let surviving_links = self.links.links_to(entity_type, surviving_id).await?;

        for link in merged_links {
            let conflict = surviving_links.iter().find(|s| s.owner == link.owner);
            match self
                .migrate_row(&link, conflict, surviving_id, merged_id, strategy)
                .await
            {
                Ok(outcome) => {
                    if outcome.conflict {
                        report.conflicts += 1;
                    }
                    if outcome.migrated {
                        report.migrated += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(
                        owner = %link.owner,
                        entity_type = %entity_type,
                        error = %err,
                        "link migration failed, continuing with next"
                    );
                }
            }
        }

        tracing::info!(
            entity_type = %entity_type,
            merged_id,
            surviving_id,
            migrated = report.migrated,
            skipped = report.skipped,
            conflicts = report.conflicts,
            errors = report.errors,
            "merge relation migration finished"
        );
        Ok(report)
    }

    async fn migrate_row(
        &self,
        link: &EntityLink,
        conflict: Option<&EntityLink>,
        surviving_id: RemoteId,
        merged_id: RemoteId,
        strategy: MergeStrategy,
    ) -> anyhow::Result<RowOutcome> {
        let rewrite = |demote: bool| {
            let mut updated = link.clone();
            updated.entity_id = surviving_id;
            updated.migrated_from = Some(merged_id);
            if demote {
                updated.is_primary = false;
            }
            updated
        };

        let Some(existing) = conflict else {
            self.links.put_link(rewrite(false)).await?;
            return Ok(RowOutcome {
                migrated: true,
                conflict: false,
            });
        };

        match strategy {
            MergeStrategy::KeepBoth => {
                // Both rows remain; the migrated one is never primary.
                self.links.put_link(rewrite(true)).await?;
                Ok(RowOutcome {
                    migrated: true,
                    conflict: true,
                })
            }
            MergeStrategy::KeepSurviving => {
                self.links.remove_link(link.id).await?;
                Ok(RowOutcome {
                    migrated: false,
                    conflict: true,
                })
            }
            MergeStrategy::KeepMerged => {
                self.links.remove_link(existing.id).await?;
                self.links.put_link(rewrite(false)).await?;
                Ok(RowOutcome {
                    migrated: true,
                    conflict: true,
                })
            }
        }
    }
}
