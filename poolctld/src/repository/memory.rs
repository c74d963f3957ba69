//! An in-memory `Repository` backend.
//!
//! Grounded on `drmem-db-simple`'s `SimpleStore`: a single mutex
//! around a hash map, nothing written to disk. This is the default
//! (and, in this workspace, only) backend -- `spec.md` treats the real
//! document store as an opaque external collaborator.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as Row;

use poolctl_api::error::{Error, Result};
use poolctl_api::repository::Repository;

/// Parses the `datetime` field of a row for ordering purposes. Rows
/// missing the field sort first (treated as the oldest possible).
fn row_datetime(row: &Row) -> chrono::DateTime<chrono::FixedOffset> {
    row.get("datetime")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::MIN_UTC.into())
}

pub struct MemoryRepository {
    collections: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        MemoryRepository {
            collections: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_latest(&self, collection: &str) -> Result<Option<Row>> {
        let guard = self
            .collections
            .lock()
            .map_err(|_| Error::StoreUnavailable("poisoned lock".into()))?;

        Ok(guard
            .get(collection)
            .and_then(|rows| rows.iter().max_by_key(|r| row_datetime(r)))
            .cloned())
    }

    async fn find_latest_keyed(
        &self,
        collection: &str,
        key: (&str, &str),
    ) -> Result<Option<Row>> {
        let guard = self
            .collections
            .lock()
            .map_err(|_| Error::StoreUnavailable("poisoned lock".into()))?;

        let (field, value) = key;
        Ok(guard.get(collection).and_then(|rows| {
            rows.iter()
                .filter(|r| r.get(field).and_then(|v| v.as_str()) == Some(value))
                .max_by_key(|r| row_datetime(r))
                .cloned()
        }))
    }

    async fn upsert_single(
        &self,
        collection: &str,
        key: Option<(&str, &str)>,
        row: Row,
    ) -> Result<()> {
        let mut guard = self
            .collections
            .lock()
            .map_err(|_| Error::StoreUnavailable("poisoned lock".into()))?;

        let rows = guard.entry(collection.to_string()).or_default();

        match key {
            Some((field, value)) => {
                if let Some(existing) = rows
                    .iter_mut()
                    .find(|r| r.get(field).and_then(|v| v.as_str()) == Some(value))
                {
                    *existing = row;
                } else {
                    rows.push(row);
                }
            }
            None => {
                rows.clear();
                rows.push(row);
            }
        }

        Ok(())
    }

    async fn insert(&self, collection: &str, row: Row) -> Result<()> {
        let mut guard = self
            .collections
            .lock()
            .map_err(|_| Error::StoreUnavailable("poisoned lock".into()))?;

        guard.entry(collection.to_string()).or_default().push(row);

        Ok(())
    }
}
