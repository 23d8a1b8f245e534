//! Single-slot durable store for an in-progress long-form draft.
//!
//! At most one draft exists at any time. A save overwrites the previous
//! record wholesale (last-write-wins, no merge); the record is removed after
//! a successful publish or an explicit discard. The draft lives under one
//! fixed, well-known key in the keyed-slot table so the store abstraction
//! stays reusable for other singleton records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::error::StoreError;

/// Well-known slot key for the compose draft.
pub const DRAFT_SLOT: &str = "compose.draft";

/// The singleton unpublished long-form document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRecord {
    pub title: String,
    /// Editor document tree, stored opaquely.
    pub body_document: serde_json::Value,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub excerpt: Option<String>,
    pub saved_at: DateTime<Utc>,
}

/// Durable single-slot draft store.
#[derive(Clone)]
pub struct DraftStore {
    store: Store,
}

impl DraftStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Atomically overwrite the singleton slot with `record`.
    ///
    /// Idempotent with respect to repeated identical calls.
    pub async fn save(&self, record: &DraftRecord) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        let saved_at = record.saved_at.to_rfc3339();

        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO kv_slots (slot, value, saved_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(slot) DO UPDATE SET
                         value = excluded.value,
                         saved_at = excluded.saved_at",
                    params![DRAFT_SLOT, value, saved_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Return the singleton record, or `None` if absent.
    pub async fn load(&self) -> Result<Option<DraftRecord>, StoreError> {
        let value: Option<String> = self
            .store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM kv_slots WHERE slot = ?1",
                    params![DRAFT_SLOT],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;

        value
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Delete the singleton. Called after a successful publish or an explicit
    /// discard; a no-op (and not an error) when no draft exists.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM kv_slots WHERE slot = ?1", params![DRAFT_SLOT])?;
                tx.commit()?;
                Ok(())
            })
            .await
    }
}
