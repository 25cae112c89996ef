//! JSONL-backed CRM client.
//!
//! Serves pages from a directory of `<entity>.jsonl` files, one JSON object
//! per line. Useful for rehearsing a full pipeline against an exported
//! dataset and for the CLI's offline mode; the driver cannot tell it apart
//! from a wire client.

use crate::client::{CrmClient, FetchedPage, PageRequest};
use async_trait::async_trait;
use std::path::PathBuf;
use sync_core::{ApiError, ConnectKind, RateMeta, Record, SortMode};

pub struct JsonlCrmClient {
    dir: PathBuf,
}

impl JsonlCrmClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonlCrmClient { dir: dir.into() }
    }

    async fn load_records(&self, entity: &str) -> Result<Vec<Record>, ApiError> {
        let path = self.dir.join(format!("{entity}.jsonl"));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            // Absent file reads as an empty collection.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ApiError::Decode(format!("cannot read {path:?}: {err}"))),
        };

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line).map_err(|err| {
                ApiError::Decode(format!("line {} of {path:?}: {err}", line_no + 1))
            })?;
            let record = Record::from_json(&value).map_err(|err| {
                ApiError::Decode(format!("line {} of {path:?}: {err}", line_no + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl CrmClient for JsonlCrmClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage, ApiError> {
        let mut records = self.load_records(request.entity_type.as_str()).await?;

        records.sort_by(|a, b| {
            let key_a = (a.updated_at, a.id);
            let key_b = (b.updated_at, b.id);
            match request.sort {
                SortMode::OldestFirst => key_a.cmp(&key_b),
                SortMode::RecentFirst => key_b.cmp(&key_a),
            }
        });

        let offset: usize = match &request.cursor {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| ApiError::Decode(format!("bad cursor: {cursor}")))?,
            None => 0,
        };

        let page: Vec<Record> = records
            .iter()
            .skip(offset)
            .take(request.page_size)
            .cloned()
            .collect();
        let consumed = offset + page.len();
        let next_cursor = (consumed < records.len()).then(|| consumed.to_string());

        Ok(FetchedPage {
            records: page,
            next_cursor,
            meta: RateMeta::default(),
        })
    }

    async fn ping(&self) -> Result<(), ApiError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(ApiError::Connect(ConnectKind::Refused))
        }
    }
}
