//! Assignment repository — `product_segment_assignments`.
//!
//! Exactly one row per (run, product). Extraction writes the initial
//! taxonomy id; refinement fills the refined one. Both writes are upserts
//! so a replayed stage cannot duplicate rows.

use std::sync::Arc;

use rusqlite::params;

use ps_domain::error::Result;
use ps_domain::taxonomy::Assignment;

use crate::db::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait AssignmentRepository: Send + Sync {
    /// Upsert initial assignments as `(product_id, taxonomy_id)` pairs.
    async fn upsert_initial(&self, run_id: &str, pairs: &[(i64, i64)]) -> Result<()>;

    /// Set refined taxonomy ids for the given products.
    async fn set_refined(&self, run_id: &str, pairs: &[(i64, i64)]) -> Result<()>;

    /// All assignments of a run, ordered by product id.
    async fn by_run(&self, run_id: &str) -> Result<Vec<Assignment>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteAssignmentRepository {
    db: Arc<Database>,
}

impl SqliteAssignmentRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl AssignmentRepository for SqliteAssignmentRepository {
    async fn upsert_initial(&self, run_id: &str, pairs: &[(i64, i64)]) -> Result<()> {
        self.db.with_mut(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO product_segment_assignments \
                     (run_id, product_id, taxonomy_id_initial) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT (run_id, product_id) \
                     DO UPDATE SET taxonomy_id_initial = excluded.taxonomy_id_initial",
                )?;
                for (product_id, taxonomy_id) in pairs {
                    stmt.execute(params![run_id, product_id, taxonomy_id])?;
                }
            }
            tx.commit()
        })
    }

    async fn set_refined(&self, run_id: &str, pairs: &[(i64, i64)]) -> Result<()> {
        self.db.with_mut(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE product_segment_assignments \
                     SET taxonomy_id_refined = ?3 \
                     WHERE run_id = ?1 AND product_id = ?2",
                )?;
                for (product_id, taxonomy_id) in pairs {
                    stmt.execute(params![run_id, product_id, taxonomy_id])?;
                }
            }
            tx.commit()
        })
    }

    async fn by_run(&self, run_id: &str) -> Result<Vec<Assignment>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT run_id, product_id, taxonomy_id_initial, taxonomy_id_refined \
                 FROM product_segment_assignments \
                 WHERE run_id = ?1 ORDER BY product_id",
            )?;
            let rows = stmt.query_map([run_id], |row| {
                Ok(Assignment {
                    run_id: row.get("run_id")?,
                    product_id: row.get("product_id")?,
                    taxonomy_id_initial: row.get("taxonomy_id_initial")?,
                    taxonomy_id_refined: row.get("taxonomy_id_refined")?,
                })
            })?;
            rows.collect()
        })
    }
}
