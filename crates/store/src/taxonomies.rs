//! Taxonomy repository — `product_segment_taxonomies`.
//!
//! Writes are upserts keyed on (run_id, segment_name, stage); the returned
//! name→id mapping is what assignment writes must reference, so callers
//! never guess at surrogate ids.

use std::sync::Arc;

use rusqlite::params;

use ps_domain::error::Result;
use ps_domain::taxonomy::{TaxonomyDraft, TaxonomyRecord, TaxonomyStage};

use crate::db::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait TaxonomyRepository: Send + Sync {
    /// Upsert a batch of taxonomies and return `(segment_name, id)` pairs
    /// in the order given.
    async fn upsert_batch(
        &self,
        run_id: &str,
        stage: TaxonomyStage,
        drafts: &[TaxonomyDraft],
    ) -> Result<Vec<(String, i64)>>;

    /// All taxonomies of a run at one stage, ordered by id.
    async fn by_run_and_stage(
        &self,
        run_id: &str,
        stage: TaxonomyStage,
    ) -> Result<Vec<TaxonomyRecord>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteTaxonomyRepository {
    db: Arc<Database>,
}

impl SqliteTaxonomyRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl TaxonomyRepository for SqliteTaxonomyRepository {
    async fn upsert_batch(
        &self,
        run_id: &str,
        stage: TaxonomyStage,
        drafts: &[TaxonomyDraft],
    ) -> Result<Vec<(String, i64)>> {
        self.db.with_mut(|c| {
            let tx = c.transaction()?;
            let mut mapping = Vec::with_capacity(drafts.len());
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO product_segment_taxonomies \
                     (run_id, segment_name, definition, stage) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (run_id, segment_name, stage) \
                     DO UPDATE SET definition = CASE \
                         WHEN product_segment_taxonomies.definition = '' \
                         THEN excluded.definition \
                         ELSE product_segment_taxonomies.definition END \
                     RETURNING id",
                )?;
                for draft in drafts {
                    let id: i64 = stmt.query_row(
                        params![run_id, draft.segment_name, draft.definition, stage.as_str()],
                        |r| r.get(0),
                    )?;
                    mapping.push((draft.segment_name.clone(), id));
                }
            }
            tx.commit()?;
            Ok(mapping)
        })
    }

    async fn by_run_and_stage(
        &self,
        run_id: &str,
        stage: TaxonomyStage,
    ) -> Result<Vec<TaxonomyRecord>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT id, run_id, segment_name, definition, stage \
                 FROM product_segment_taxonomies \
                 WHERE run_id = ?1 AND stage = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id, stage.as_str()], |row| {
                let stage_str: String = row.get("stage")?;
                Ok(TaxonomyRecord {
                    id: row.get("id")?,
                    run_id: row.get("run_id")?,
                    segment_name: row.get("segment_name")?,
                    definition: row.get("definition")?,
                    stage: TaxonomyStage::parse(&stage_str).unwrap_or(TaxonomyStage::Extraction),
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str) -> TaxonomyDraft {
        TaxonomyDraft {
            segment_name: name.into(),
            definition: format!("{name} definition"),
            product_count: 1,
        }
    }

    fn repo() -> SqliteTaxonomyRepository {
        SqliteTaxonomyRepository::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn upsert_returns_name_id_mapping() {
        let repo = repo();
        let mapping = repo
            .upsert_batch("RUN_A", TaxonomyStage::Extraction, &[draft("Smart"), draft("Manual")])
            .await
            .unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[0].0, "Smart");
        assert_ne!(mapping[0].1, mapping[1].1);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_natural_key() {
        let repo = repo();
        let first = repo
            .upsert_batch("RUN_A", TaxonomyStage::Extraction, &[draft("Smart")])
            .await
            .unwrap();
        let second = repo
            .upsert_batch("RUN_A", TaxonomyStage::Extraction, &[draft("Smart")])
            .await
            .unwrap();
        assert_eq!(first[0].1, second[0].1);

        let records = repo
            .by_run_and_stage("RUN_A", TaxonomyStage::Extraction)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_first_non_empty_definition() {
        let repo = repo();
        repo.upsert_batch(
            "RUN_A",
            TaxonomyStage::Extraction,
            &[TaxonomyDraft {
                segment_name: "X".into(),
                definition: "original".into(),
                product_count: 1,
            }],
        )
        .await
        .unwrap();
        repo.upsert_batch(
            "RUN_A",
            TaxonomyStage::Extraction,
            &[TaxonomyDraft {
                segment_name: "X".into(),
                definition: "replacement".into(),
                product_count: 1,
            }],
        )
        .await
        .unwrap();

        let records = repo
            .by_run_and_stage("RUN_A", TaxonomyStage::Extraction)
            .await
            .unwrap();
        assert_eq!(records[0].definition, "original");
    }

    #[tokio::test]
    async fn upsert_fills_empty_definition() {
        let repo = repo();
        repo.upsert_batch(
            "RUN_A",
            TaxonomyStage::Extraction,
            &[TaxonomyDraft {
                segment_name: "X".into(),
                definition: String::new(),
                product_count: 1,
            }],
        )
        .await
        .unwrap();
        repo.upsert_batch(
            "RUN_A",
            TaxonomyStage::Extraction,
            &[TaxonomyDraft {
                segment_name: "X".into(),
                definition: "late".into(),
                product_count: 1,
            }],
        )
        .await
        .unwrap();

        let records = repo
            .by_run_and_stage("RUN_A", TaxonomyStage::Extraction)
            .await
            .unwrap();
        assert_eq!(records[0].definition, "late");
    }

    #[tokio::test]
    async fn same_name_in_different_stages_gets_distinct_rows() {
        let repo = repo();
        let ext = repo
            .upsert_batch("RUN_A", TaxonomyStage::Extraction, &[draft("Mechanical")])
            .await
            .unwrap();
        let con = repo
            .upsert_batch("RUN_A", TaxonomyStage::Consolidation, &[draft("Mechanical")])
            .await
            .unwrap();
        assert_ne!(ext[0].1, con[0].1);
    }

    #[tokio::test]
    async fn same_name_in_different_runs_gets_distinct_rows() {
        let repo = repo();
        let a = repo
            .upsert_batch("RUN_A", TaxonomyStage::Consolidation, &[draft("Smart")])
            .await
            .unwrap();
        let b = repo
            .upsert_batch("RUN_B", TaxonomyStage::Consolidation, &[draft("Smart")])
            .await
            .unwrap();
        assert_ne!(a[0].1, b[0].1);
    }

    #[tokio::test]
    async fn by_run_and_stage_filters() {
        let repo = repo();
        repo.upsert_batch("RUN_A", TaxonomyStage::Extraction, &[draft("X"), draft("Y")])
            .await
            .unwrap();
        repo.upsert_batch("RUN_A", TaxonomyStage::Consolidation, &[draft("Z")])
            .await
            .unwrap();

        let con = repo
            .by_run_and_stage("RUN_A", TaxonomyStage::Consolidation)
            .await
            .unwrap();
        assert_eq!(con.len(), 1);
        assert_eq!(con[0].segment_name, "Z");
        assert_eq!(con[0].stage, TaxonomyStage::Consolidation);
    }
}
