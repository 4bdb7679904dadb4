//! Run repository — CRUD over `product_segment_runs` plus the run-product
//! association rows created once at run start.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use ps_domain::error::{Error, Result};
use ps_domain::run::{LlmSnapshot, ProcessingParams, ProgressCounters, SegmentRun, Stage};

use crate::db::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence seam for run records. The orchestrator is the only writer.
#[async_trait::async_trait]
pub trait RunRepository: Send + Sync {
    async fn create(&self, run: &SegmentRun) -> Result<()>;
    async fn get(&self, run_id: &str) -> Result<Option<SegmentRun>>;
    async fn update_stage(&self, run_id: &str, stage: Stage) -> Result<()>;
    /// Absolute counter values; last-writer-wins by design.
    async fn update_progress(
        &self,
        run_id: &str,
        progress: ProgressCounters,
        processed_products: u32,
    ) -> Result<()>;
    async fn complete(&self, run_id: &str, result_summary: serde_json::Value) -> Result<()>;
    async fn recent(&self, limit: usize) -> Result<Vec<SegmentRun>>;
    async fn by_stage(&self, stage: Stage) -> Result<Vec<SegmentRun>>;

    /// Associate products with a run. Idempotent on (run_id, product_id).
    async fn create_run_products(&self, run_id: &str, product_ids: &[i64]) -> Result<()>;
    /// Products of a run in insertion order.
    async fn get_run_products(&self, run_id: &str) -> Result<Vec<i64>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteRunRepository {
    db: Arc<Database>,
}

impl SqliteRunRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<SegmentRun> {
    let stage_str: String = row.get("stage")?;
    let llm_json: String = row.get("llm_config")?;
    let params_json: String = row.get("processing_params")?;
    let summary_json: Option<String> = row.get("result_summary")?;
    let created_str: String = row.get("created_at")?;

    let llm_config: LlmSnapshot = serde_json::from_str(&llm_json).unwrap_or(LlmSnapshot {
        model: String::new(),
        temperature: 0.0,
        max_tokens: 0,
    });
    let processing_params: ProcessingParams =
        serde_json::from_str(&params_json).unwrap_or(ProcessingParams {
            extraction_batch_size: 0,
            refinement_batch_size: 0,
        });

    Ok(SegmentRun {
        id: row.get("id")?,
        stage: Stage::parse(&stage_str).unwrap_or(Stage::Failed),
        progress: ProgressCounters {
            seg_batches_done: row.get("seg_batches_done")?,
            seg_batches_total: row.get("seg_batches_total")?,
            con_batches_done: row.get("con_batches_done")?,
            con_batches_total: row.get("con_batches_total")?,
            ref_batches_done: row.get("ref_batches_done")?,
            ref_batches_total: row.get("ref_batches_total")?,
        },
        total_products: row.get("total_products")?,
        processed_products: row.get("processed_products")?,
        product_category: row.get("product_category")?,
        llm_config,
        processing_params,
        result_summary: summary_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_COLS: &str = "id, stage, seg_batches_done, seg_batches_total, \
     con_batches_done, con_batches_total, ref_batches_done, ref_batches_total, \
     total_products, processed_products, product_category, llm_config, \
     processing_params, result_summary, created_at";

#[async_trait::async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create(&self, run: &SegmentRun) -> Result<()> {
        let llm_json = serde_json::to_string(&run.llm_config)?;
        let params_json = serde_json::to_string(&run.processing_params)?;
        self.db.with(|c| {
            c.execute(
                "INSERT INTO product_segment_runs \
                 (id, stage, seg_batches_done, seg_batches_total, con_batches_done, \
                  con_batches_total, ref_batches_done, ref_batches_total, total_products, \
                  processed_products, product_category, llm_config, processing_params, \
                  result_summary, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    run.id,
                    run.stage.as_str(),
                    run.progress.seg_batches_done,
                    run.progress.seg_batches_total,
                    run.progress.con_batches_done,
                    run.progress.con_batches_total,
                    run.progress.ref_batches_done,
                    run.progress.ref_batches_total,
                    run.total_products,
                    run.processed_products,
                    run.product_category,
                    llm_json,
                    params_json,
                    run.result_summary.as_ref().map(|v| v.to_string()),
                    run.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    async fn get(&self, run_id: &str) -> Result<Option<SegmentRun>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {SELECT_COLS} FROM product_segment_runs WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map([run_id], row_to_run)?;
            rows.next().transpose()
        })
    }

    async fn update_stage(&self, run_id: &str, stage: Stage) -> Result<()> {
        let updated = self.db.with(|c| {
            c.execute(
                "UPDATE product_segment_runs SET stage = ?2 WHERE id = ?1",
                params![run_id, stage.as_str()],
            )
        })?;
        if updated == 0 {
            return Err(Error::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        run_id: &str,
        progress: ProgressCounters,
        processed_products: u32,
    ) -> Result<()> {
        self.db.with(|c| {
            c.execute(
                "UPDATE product_segment_runs SET \
                 seg_batches_done = ?2, seg_batches_total = ?3, \
                 con_batches_done = ?4, con_batches_total = ?5, \
                 ref_batches_done = ?6, ref_batches_total = ?7, \
                 processed_products = ?8 \
                 WHERE id = ?1",
                params![
                    run_id,
                    progress.seg_batches_done,
                    progress.seg_batches_total,
                    progress.con_batches_done,
                    progress.con_batches_total,
                    progress.ref_batches_done,
                    progress.ref_batches_total,
                    processed_products,
                ],
            )?;
            Ok(())
        })
    }

    async fn complete(&self, run_id: &str, result_summary: serde_json::Value) -> Result<()> {
        self.db.with(|c| {
            c.execute(
                "UPDATE product_segment_runs SET stage = ?2, result_summary = ?3 WHERE id = ?1",
                params![
                    run_id,
                    Stage::Completed.as_str(),
                    result_summary.to_string()
                ],
            )?;
            Ok(())
        })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SegmentRun>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {SELECT_COLS} FROM product_segment_runs \
                 ORDER BY created_at DESC, id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit as i64], row_to_run)?;
            rows.collect()
        })
    }

    async fn by_stage(&self, stage: Stage) -> Result<Vec<SegmentRun>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {SELECT_COLS} FROM product_segment_runs \
                 WHERE stage = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([stage.as_str()], row_to_run)?;
            rows.collect()
        })
    }

    async fn create_run_products(&self, run_id: &str, product_ids: &[i64]) -> Result<()> {
        self.db.with_mut(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO product_segment_run_products (run_id, product_id) \
                     VALUES (?1, ?2) ON CONFLICT (run_id, product_id) DO NOTHING",
                )?;
                for pid in product_ids {
                    stmt.execute(params![run_id, pid])?;
                }
            }
            tx.commit()
        })
    }

    async fn get_run_products(&self, run_id: &str) -> Result<Vec<i64>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT product_id FROM product_segment_run_products \
                 WHERE run_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map([run_id], |r| r.get(0))?;
            rows.collect()
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn test_run(total: u32) -> SegmentRun {
        SegmentRun::new(
            total,
            "Lighting".into(),
            LlmSnapshot {
                model: "gpt-4o".into(),
                temperature: 0.2,
                max_tokens: 4096,
            },
            ProcessingParams {
                extraction_batch_size: 40,
                refinement_batch_size: 40,
            },
        )
    }

    fn repo() -> SqliteRunRepository {
        SqliteRunRepository::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let repo = repo();
        let run = test_run(3);
        repo.create(&run).await.unwrap();

        let fetched = repo.get(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.stage, Stage::Init);
        assert_eq!(fetched.total_products, 3);
        assert_eq!(fetched.product_category, "Lighting");
        assert_eq!(fetched.llm_config.model, "gpt-4o");
    }

    #[tokio::test]
    async fn get_unknown_returns_none() {
        let repo = repo();
        assert!(repo.get("RUN_NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stage_and_progress_updates() {
        let repo = repo();
        let run = test_run(8);
        repo.create(&run).await.unwrap();

        repo.update_stage(&run.id, Stage::Extraction).await.unwrap();
        repo.update_progress(
            &run.id,
            ProgressCounters {
                seg_batches_done: 1,
                seg_batches_total: 2,
                ..Default::default()
            },
            4,
        )
        .await
        .unwrap();

        let fetched = repo.get(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.stage, Stage::Extraction);
        assert_eq!(fetched.progress.seg_batches_done, 1);
        assert_eq!(fetched.processed_products, 4);
    }

    #[tokio::test]
    async fn update_stage_on_unknown_run_is_not_found() {
        let repo = repo();
        let err = repo.update_stage("RUN_NOPE", Stage::Extraction).await;
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn complete_sets_stage_and_summary() {
        let repo = repo();
        let run = test_run(1);
        repo.create(&run).await.unwrap();
        repo.complete(&run.id, serde_json::json!({ "taxonomies": 2 }))
            .await
            .unwrap();

        let fetched = repo.get(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.stage, Stage::Completed);
        assert_eq!(fetched.result_summary.unwrap()["taxonomies"], 2);
    }

    #[tokio::test]
    async fn run_products_idempotent_and_ordered() {
        let repo = repo();
        let run = test_run(3);
        repo.create(&run).await.unwrap();

        repo.create_run_products(&run.id, &[101, 102, 103])
            .await
            .unwrap();
        // Replay must not duplicate.
        repo.create_run_products(&run.id, &[101, 102, 103])
            .await
            .unwrap();

        let products = repo.get_run_products(&run.id).await.unwrap();
        assert_eq!(products, vec![101, 102, 103]);
    }

    #[tokio::test]
    async fn recent_and_by_stage() {
        let repo = repo();
        let a = test_run(1);
        let b = test_run(1);
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();
        repo.update_stage(&a.id, Stage::Failed).await.unwrap();

        assert_eq!(repo.recent(10).await.unwrap().len(), 2);
        let failed = repo.by_stage(Stage::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);
    }
}
