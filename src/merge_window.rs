//! Heuristic merge detection over the webhook stream.
//!
//! Some providers never send an explicit merge event; what arrives instead
//! is a burst of updates to the involved records followed by a delete of
//! the retired one, all sharing a correlation id. The window buffers those
//! observations for a short TTL and a pure evaluation over the buffered
//! entries decides whether they spell a merge.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use sync_core::{EntityType, MergeDetection, MergeEvent, RemoteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
struct WindowEntry {
    entity_type: EntityType,
    record_id: RemoteId,
    kind: EntryKind,
    at: DateTime<Utc>,
}

/// Rolling buffer of recent webhook observations keyed by correlation id.
pub struct MergeWindow {
    ttl: Duration,
    entries: HashMap<String, Vec<WindowEntry>>,
}

impl MergeWindow {
    pub fn new(ttl: Duration) -> Self {
        MergeWindow {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn note_update(
        &mut self,
        correlation_id: &str,
        entity_type: EntityType,
        record_id: RemoteId,
        at: DateTime<Utc>,
    ) {
        self.note(correlation_id, entity_type, record_id, EntryKind::Updated, at);
    }

    pub fn note_delete(
        &mut self,
        correlation_id: &str,
        entity_type: EntityType,
        record_id: RemoteId,
        at: DateTime<Utc>,
    ) {
        self.note(correlation_id, entity_type, record_id, EntryKind::Deleted, at);
    }

    fn note(
        &mut self,
        correlation_id: &str,
        entity_type: EntityType,
        record_id: RemoteId,
        kind: EntryKind,
        at: DateTime<Utc>,
    ) {
        self.prune(at);
        self.entries
            .entry(correlation_id.to_string())
            .or_default()
            .push(WindowEntry {
                entity_type,
                record_id,
                kind,
                at,
            });
    }

    /// Drop entries older than the TTL relative to `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        self.entries.retain(|_, entries| {
            entries.retain(|e| now - e.at <= ttl);
            !entries.is_empty()
        });
    }

    /// Evaluate the buffered entries for one correlation id.
    pub fn detect(&self, correlation_id: &str) -> Option<MergeEvent> {
        evaluate(self.entries.get(correlation_id)?)
    }

    /// Forget a correlation id, e.g. once its merge has been handled.
    pub fn clear(&mut self, correlation_id: &str) {
        self.entries.remove(correlation_id);
    }
}

/// Pure merge-pattern evaluation: two-or-more records of one entity type
/// updated and one of them subsequently deleted means the deleted record
/// was merged into the survivor. With more than two updates the survivor is
/// the most recently updated remaining record, ties broken by highest id
/// so replays stay deterministic.
fn evaluate(entries: &[WindowEntry]) -> Option<MergeEvent> {
    let deleted = entries.iter().find(|e| e.kind == EntryKind::Deleted)?;

    let updates: Vec<&WindowEntry> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Updated && e.entity_type == deleted.entity_type)
        .collect();

    let mut updated_ids: Vec<RemoteId> = updates.iter().map(|e| e.record_id).collect();
    updated_ids.sort_unstable();
    updated_ids.dedup();
    if updated_ids.len() < 2 || !updated_ids.contains(&deleted.record_id) {
        return None;
    }

    let surviving = updates
        .iter()
        .filter(|e| e.record_id != deleted.record_id)
        .max_by(|a, b| a.at.cmp(&b.at).then(a.record_id.cmp(&b.record_id)))?;

    Some(MergeEvent {
        entity_type: deleted.entity_type,
        merged_id: deleted.record_id,
        surviving_id: surviving.record_id,
        detected_via: MergeDetection::Heuristic,
    })
}
