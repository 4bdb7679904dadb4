//! SQLite connection handling and schema.
//!
//! One connection per process, serialized behind a mutex. The schema is
//! applied idempotently at open, so a fresh database file is usable
//! immediately.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use ps_domain::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS product_segment_runs (
    id                  TEXT PRIMARY KEY,
    stage               TEXT NOT NULL,
    seg_batches_done    INTEGER NOT NULL DEFAULT 0,
    seg_batches_total   INTEGER NOT NULL DEFAULT 0,
    con_batches_done    INTEGER NOT NULL DEFAULT 0,
    con_batches_total   INTEGER NOT NULL DEFAULT 0,
    ref_batches_done    INTEGER NOT NULL DEFAULT 0,
    ref_batches_total   INTEGER NOT NULL DEFAULT 0,
    total_products      INTEGER NOT NULL,
    processed_products  INTEGER NOT NULL DEFAULT 0,
    product_category    TEXT NOT NULL,
    llm_config          TEXT NOT NULL,
    processing_params   TEXT NOT NULL,
    result_summary      TEXT,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS product_segment_run_products (
    run_id      TEXT NOT NULL,
    product_id  INTEGER NOT NULL,
    UNIQUE (run_id, product_id)
);

CREATE TABLE IF NOT EXISTS product_segment_taxonomies (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id        TEXT NOT NULL,
    segment_name  TEXT NOT NULL,
    definition    TEXT NOT NULL DEFAULT '',
    stage         TEXT NOT NULL,
    UNIQUE (run_id, segment_name, stage)
);

CREATE TABLE IF NOT EXISTS product_segment_assignments (
    run_id               TEXT NOT NULL,
    product_id           INTEGER NOT NULL,
    taxonomy_id_initial  INTEGER NOT NULL,
    taxonomy_id_refined  INTEGER,
    UNIQUE (run_id, product_id)
);

CREATE TABLE IF NOT EXISTS product_segment_llm_interactions (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id            TEXT NOT NULL,
    interaction_type  TEXT NOT NULL,
    batch_id          INTEGER NOT NULL,
    attempt           INTEGER NOT NULL DEFAULT 1,
    file_path         TEXT NOT NULL,
    cache_key         TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_cache_key
    ON product_segment_llm_interactions (cache_key);
CREATE INDEX IF NOT EXISTS idx_interactions_run
    ON product_segment_llm_interactions (run_id);

CREATE TABLE IF NOT EXISTS products (
    id     INTEGER PRIMARY KEY,
    title  TEXT NOT NULL
);
"#;

/// Shared SQLite handle. Repositories clone the `Arc` wrapping this.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(from_sqlite)?;
        conn.execute_batch(SCHEMA).map_err(from_sqlite)?;
        tracing::info!(path = %path.display(), "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(from_sqlite)?;
        conn.execute_batch(SCHEMA).map_err(from_sqlite)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with the connection lock held. Queries are short; nothing
    /// awaits while holding the lock.
    pub fn with<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        f(&conn).map_err(from_sqlite)
    }

    /// Like [`Database::with`], but with a mutable connection (transactions).
    pub fn with_mut<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> Result<R> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(from_sqlite)
    }
}

pub(crate) fn from_sqlite(e: rusqlite::Error) -> Error {
    Error::Db(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_to_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("seg.db")).unwrap();
        let count: i64 = db
            .with(|c| {
                c.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert!(count >= 6);
    }

    #[test]
    fn schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.db");
        drop(Database::open(&path).unwrap());
        // Re-opening re-applies CREATE IF NOT EXISTS without error.
        Database::open(&path).unwrap();
    }
}
