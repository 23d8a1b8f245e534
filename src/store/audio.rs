//! Durable store for locally recorded audio clips.
//!
//! A clip is written when capture stops; its id is embedded as a reference
//! marker inside the text message announcing it. Clips are removed by
//! explicit user action or by the age-based retention sweep, which is meant
//! to run opportunistically on startup rather than on a timer.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::error::StoreError;

/// One captured audio clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRecord {
    pub id: String,
    pub audio_data: Vec<u8>,
    pub duration_seconds: f64,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
}

/// Durable audio clip store, indexed by conversation and creation time.
#[derive(Clone)]
pub struct AudioStore {
    store: Store,
}

impl AudioStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Store a freshly captured clip and return its id for embedding in the
    /// referencing message.
    pub async fn save(
        &self,
        audio_data: Vec<u8>,
        duration_seconds: f64,
        conversation_id: &str,
    ) -> Result<String, StoreError> {
        let record = AudioRecord {
            id: new_clip_id()?,
            audio_data,
            duration_seconds,
            conversation_id: conversation_id.to_string(),
            created_at: Utc::now(),
        };
        let id = record.id.clone();
        self.insert(record).await?;
        Ok(id)
    }

    async fn insert(&self, record: AudioRecord) -> Result<(), StoreError> {
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO audio_clips
                         (id, conversation_id, duration_seconds, audio_data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.id,
                        record.conversation_id,
                        record.duration_seconds,
                        record.audio_data,
                        record.created_at.to_rfc3339(),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Return the clip, or `None` if it was never stored or already evicted.
    pub async fn get(&self, id: &str) -> Result<Option<AudioRecord>, StoreError> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, conversation_id, duration_seconds, audio_data, created_at
                     FROM audio_clips WHERE id = ?1",
                    params![id],
                    row_to_record,
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await
    }

    /// All clips for one conversation, oldest first.
    pub async fn list_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<AudioRecord>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, duration_seconds, audio_data, created_at
                     FROM audio_clips
                     WHERE conversation_id = ?1
                     ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map(params![conversation_id], row_to_record)?;

                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok(records)
            })
            .await
    }

    /// Remove one clip by explicit user action.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let affected = tx.execute("DELETE FROM audio_clips WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(affected > 0)
            })
            .await
    }

    /// Delete every clip created before `now - days`. Returns the number of
    /// clips removed.
    pub async fn sweep_older_than(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let removed = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let affected = tx.execute(
                    "DELETE FROM audio_clips WHERE created_at < ?1",
                    params![cutoff],
                )?;
                tx.commit()?;
                Ok(affected)
            })
            .await?;

        if removed > 0 {
            tracing::info!(removed, days, "swept expired audio clips");
        }
        Ok(removed)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AudioRecord> {
    let created_at: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AudioRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        duration_seconds: row.get(2)?,
        audio_data: row.get(3)?,
        created_at,
    })
}

/// Collision-resistant clip id: millisecond timestamp plus a random suffix.
fn new_clip_id() -> Result<String, StoreError> {
    let mut suffix = [0u8; 4];
    getrandom::getrandom(&mut suffix)?;
    Ok(format!(
        "{}-{:08x}",
        Utc::now().timestamp_millis(),
        u32::from_be_bytes(suffix)
    ))
}
