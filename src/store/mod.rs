//! Durable local storage.
//!
//! Both local stores (draft, audio) share one [`Store`] handle: a SQLite
//! database opened in WAL mode. Every public operation runs its statements
//! inside an explicit transaction on a blocking worker thread, so async
//! callers suspend until the commit without blocking unrelated work.

pub mod audio;
pub mod draft;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::StoreError;

pub use audio::{AudioRecord, AudioStore};
pub use draft::{DraftRecord, DraftStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_slots (
    slot     TEXT PRIMARY KEY,
    value    TEXT NOT NULL,
    saved_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audio_clips (
    id               TEXT PRIMARY KEY,
    conversation_id  TEXT NOT NULL,
    duration_seconds REAL NOT NULL,
    audio_data       BLOB NOT NULL,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audio_conversation ON audio_clips (conversation_id);
CREATE INDEX IF NOT EXISTS idx_audio_created ON audio_clips (created_at);
";

/// Shared handle to the local database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the default application database in the
    /// platform-appropriate data directory.
    pub fn open_default() -> Result<Self, StoreError> {
        let project_dirs =
            ProjectDirs::from("com", "chat-core", "chat-core").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("chat-core.db");
        tracing::info!(path = %db_path.display(), "opening local store");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path. Useful for tests and
    /// for embedding the store inside custom directory layouts.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open an in-memory database. Contents are lost on drop.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Return the filesystem path of the open database (if file-backed).
    pub fn path(&self) -> Option<PathBuf> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        guard.path().map(PathBuf::from)
    }

    /// Run `f` against the connection on a blocking worker thread.
    ///
    /// The caller suspends until `f` returns; other tasks keep running.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|_| StoreError::TaskCancelled)?
    }
}
