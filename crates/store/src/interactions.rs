//! Interaction index repository — `product_segment_llm_interactions`.
//!
//! One row per persisted LLM call; the blob itself is opaque to the
//! database, which holds only the `file_path` pointer and the `cache_key`
//! used for replay lookups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use ps_domain::error::Result;
use ps_domain::interaction::{InteractionIndexEntry, InteractionKind};

use crate::db::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// New-row value
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Insert payload; `id` and `created_at` are allocated by the repository.
#[derive(Debug, Clone)]
pub struct NewInteraction {
    pub run_id: String,
    pub interaction_type: InteractionKind,
    pub batch_id: u32,
    pub attempt: u32,
    pub file_path: String,
    pub cache_key: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait InteractionIndexRepository: Send + Sync {
    async fn insert(&self, row: NewInteraction) -> Result<i64>;

    /// The oldest row carrying `cache_key`, if any — one hit is all the
    /// replay path needs.
    async fn get_by_cache_key(&self, cache_key: &str) -> Result<Option<InteractionIndexEntry>>;

    /// All rows of a run ordered by id, for auditing.
    async fn by_run(&self, run_id: &str) -> Result<Vec<InteractionIndexEntry>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteInteractionIndexRepository {
    db: Arc<Database>,
}

impl SqliteInteractionIndexRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<InteractionIndexEntry> {
    let kind_str: String = row.get("interaction_type")?;
    let created_str: String = row.get("created_at")?;
    Ok(InteractionIndexEntry {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        interaction_type: InteractionKind::parse(&kind_str)
            .unwrap_or(InteractionKind::Extraction),
        batch_id: row.get("batch_id")?,
        attempt: row.get("attempt")?,
        file_path: row.get("file_path")?,
        cache_key: row.get("cache_key")?,
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait::async_trait]
impl InteractionIndexRepository for SqliteInteractionIndexRepository {
    async fn insert(&self, row: NewInteraction) -> Result<i64> {
        self.db.with(|c| {
            c.execute(
                "INSERT INTO product_segment_llm_interactions \
                 (run_id, interaction_type, batch_id, attempt, file_path, cache_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.run_id,
                    row.interaction_type.as_str(),
                    row.batch_id,
                    row.attempt,
                    row.file_path,
                    row.cache_key,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(c.last_insert_rowid())
        })
    }

    async fn get_by_cache_key(&self, cache_key: &str) -> Result<Option<InteractionIndexEntry>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT id, run_id, interaction_type, batch_id, attempt, file_path, \
                 cache_key, created_at \
                 FROM product_segment_llm_interactions \
                 WHERE cache_key = ?1 ORDER BY id LIMIT 1",
            )?;
            let mut rows = stmt.query_map([cache_key], row_to_entry)?;
            rows.next().transpose()
        })
    }

    async fn by_run(&self, run_id: &str) -> Result<Vec<InteractionIndexEntry>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT id, run_id, interaction_type, batch_id, attempt, file_path, \
                 cache_key, created_at \
                 FROM product_segment_llm_interactions \
                 WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([run_id], row_to_entry)?;
            rows.collect()
        })
    }
}
