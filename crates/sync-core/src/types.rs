//! Entity, record, and paging types shared across the sync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote identifier assigned by the CRM provider.
pub type RemoteId = i64;

/// Error raised when parsing one of the string-backed enums in this crate.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TypeParseError(pub String);

/// A remote CRM collection that can be synchronized.
///
/// The driver validates entity types up front so a typo in an option or a
/// webhook payload fails fast instead of producing empty sync runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Deals,
    Persons,
    Organizations,
    Products,
    Activities,
    Notes,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Deals,
        EntityType::Persons,
        EntityType::Organizations,
        EntityType::Products,
        EntityType::Activities,
        EntityType::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Deals => "deals",
            EntityType::Persons => "persons",
            EntityType::Organizations => "organizations",
            EntityType::Products => "products",
            EntityType::Activities => "activities",
            EntityType::Notes => "notes",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deals" => Ok(EntityType::Deals),
            "persons" => Ok(EntityType::Persons),
            "organizations" => Ok(EntityType::Organizations),
            "products" => Ok(EntityType::Products),
            "activities" => Ok(EntityType::Activities),
            "notes" => Ok(EntityType::Notes),
            other => Err(TypeParseError(format!("unknown entity type: {other}"))),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote record, as returned by a page fetch or a webhook payload.
///
/// Field values are carried as raw JSON; field-by-field casting into local
/// models is the host application's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RemoteId,
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Last modification time as reported by the provider, when present.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: RemoteId, fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Record {
            id,
            fields,
            updated_at: None,
        }
    }

    /// Build a record from a raw JSON object.
    ///
    /// The object must carry a numeric `id`; `update_time` or `updated_at`
    /// is picked up as the modification timestamp when parseable.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, TypeParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| TypeParseError("record payload is not a JSON object".into()))?;

        let id = obj
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| TypeParseError("record payload has no numeric 'id'".into()))?;

        let updated_at = obj
            .get("update_time")
            .or_else(|| obj.get("updated_at"))
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Record {
            id,
            fields: obj.clone(),
            updated_at,
        })
    }
}

/// Pagination ordering requested from the remote API.
///
/// Full syncs walk oldest-first for stable pagination across the whole
/// dataset; incremental syncs walk most-recently-modified-first and stop
/// at a bounded page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    OldestFirst,
    RecentFirst,
}

/// Which kind of sync run is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl std::str::FromStr for SyncMode {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(TypeParseError(format!("unknown sync mode: {other}"))),
        }
    }
}

/// Outcome of upserting one record into local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Skipped,
}

/// Outcome of deleting one record from local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}
