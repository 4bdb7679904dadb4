//! Orchestrator — owns run records and drives a run through the stages.
//!
//! The service is the only writer of run state and progress. Stage
//! transitions are forward-only; any error surfacing from a stage writes
//! the terminal `failed` stage before it propagates to the API layer.
//! Re-invoking execution on a terminal run is a no-op; on an interrupted
//! run it resumes from the recorded stage — repository upserts and the
//! interaction cache make replayed work idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use ps_domain::config::Config;
use ps_domain::error::{Error, Result};
use ps_domain::run::{LlmSnapshot, ProcessingParams, ProgressCounters, SegmentRun, Stage};
use ps_domain::taxonomy::{TaxonomyDraft, TaxonomyRecord, TaxonomyStage};
use ps_engine::prompts;
use ps_store::{AssignmentRepository, InteractionStore, RunRepository, TaxonomyRepository};

use super::cancel::{CancelMap, CancelToken};
use super::llm::CallBudget;
use super::stages::{ConsolidationOutcome, ProgressSink, StageContext, StageEngine};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result views
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyView {
    pub id: i64,
    pub segment_name: String,
    pub definition: String,
    pub product_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentView {
    pub product_id: i64,
    pub taxonomy_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsView {
    pub run_id: String,
    pub taxonomies: Vec<TaxonomyView>,
    pub segments: Vec<SegmentView>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Progress tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persists absolute progress counters after each batch. Counters only
/// move forward, including across a resume.
struct ProgressTracker {
    runs: Arc<dyn RunRepository>,
    run_id: String,
    state: Mutex<(ProgressCounters, u32)>,
}

impl ProgressTracker {
    fn new(runs: Arc<dyn RunRepository>, run_id: String, initial: ProgressCounters, processed: u32) -> Self {
        Self {
            runs,
            run_id,
            state: Mutex::new((initial, processed)),
        }
    }

    async fn persist(&self) {
        let (counters, processed) = *self.state.lock();
        if let Err(e) = self
            .runs
            .update_progress(&self.run_id, counters, processed)
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %e, "progress write failed");
        }
    }
}

#[async_trait::async_trait]
impl ProgressSink for ProgressTracker {
    async fn extraction_batch_done(&self, batches_done: u32, products_done: u32) {
        {
            let mut state = self.state.lock();
            state.0.seg_batches_done = state.0.seg_batches_done.max(batches_done);
            state.1 = state.1.max(products_done);
        }
        self.persist().await;
    }

    async fn consolidation_merge_done(&self, merges_done: u32) {
        {
            let mut state = self.state.lock();
            state.0.con_batches_done = state.0.con_batches_done.max(merges_done);
        }
        self.persist().await;
    }

    async fn refinement_batch_done(&self, batches_done: u32) {
        {
            let mut state = self.state.lock();
            state.0.ref_batches_done = state.0.ref_batches_done.max(batches_done);
        }
        self.persist().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SegmentationService {
    config: Arc<Config>,
    runs: Arc<dyn RunRepository>,
    taxonomies: Arc<dyn TaxonomyRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    engine: Arc<StageEngine>,
    store: Arc<InteractionStore>,
    cancels: CancelMap,
}

impl SegmentationService {
    pub fn new(
        config: Arc<Config>,
        runs: Arc<dyn RunRepository>,
        taxonomies: Arc<dyn TaxonomyRepository>,
        assignments: Arc<dyn AssignmentRepository>,
        engine: Arc<StageEngine>,
        store: Arc<InteractionStore>,
    ) -> Self {
        Self {
            config,
            runs,
            taxonomies,
            assignments,
            engine,
            store,
            cancels: CancelMap::new(),
        }
    }

    // ── CreateRun ────────────────────────────────────────────────────

    /// Validate inputs, persist the run record with precomputed batch
    /// totals, and associate the product list. Returns the run id.
    pub async fn create_run(&self, product_ids: &[i64], product_category: &str) -> Result<String> {
        if product_ids.is_empty() {
            return Err(Error::InvalidInput("product list is empty".into()));
        }
        if product_category.trim().is_empty() {
            return Err(Error::InvalidInput("product category is blank".into()));
        }

        // Duplicate ids collapse to one run-product row; totals follow suit.
        let mut seen = std::collections::HashSet::new();
        let unique: Vec<i64> = product_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let stages = &self.config.stages;
        let n = unique.len();
        let seg_total = n.div_ceil(stages.products_per_taxonomy_prompt) as u32;
        let con_total = seg_total.saturating_sub(1);
        let ref_total = n.div_ceil(stages.products_per_refinement) as u32;

        let mut run = SegmentRun::new(
            n as u32,
            product_category.to_string(),
            LlmSnapshot {
                model: self.config.llm.model.clone(),
                temperature: self.config.llm.temperature,
                max_tokens: self.config.llm.max_tokens,
            },
            ProcessingParams {
                extraction_batch_size: stages.products_per_taxonomy_prompt,
                refinement_batch_size: stages.products_per_refinement,
            },
        );
        run.progress.seg_batches_total = seg_total;
        run.progress.con_batches_total = con_total;
        run.progress.ref_batches_total = ref_total;

        self.runs.create(&run).await?;
        self.runs.create_run_products(&run.id, &unique).await?;
        tracing::info!(
            run_id = %run.id,
            products = n,
            category = %product_category,
            "run created"
        );
        Ok(run.id)
    }

    // ── ExecuteRun ───────────────────────────────────────────────────

    /// Drive a run to completion. Terminal runs are a no-op; an
    /// interrupted run resumes from its recorded stage. Any error writes
    /// `failed` before propagating.
    pub async fn execute_run(&self, run_id: &str) -> Result<()> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;

        if run.stage.is_terminal() {
            tracing::info!(run_id, stage = %run.stage, "run already terminal");
            return Ok(());
        }
        if self.cancels.is_running(run_id) {
            tracing::info!(run_id, "run already executing");
            return Ok(());
        }

        let cancel = self.cancels.register(run_id);
        let result = self.drive(run, cancel).await;
        self.cancels.remove(run_id);

        if let Err(ref e) = result {
            tracing::error!(run_id, error = %e, "run failed");
            if let Err(we) = self.runs.update_stage(run_id, Stage::Failed).await {
                tracing::error!(run_id, error = %we, "could not record failed stage");
            }
        }
        result
    }

    /// Request cancellation of an executing run. Returns true if a token
    /// was signalled.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.cancels.cancel(run_id)
    }

    async fn drive(&self, run: SegmentRun, cancel: CancelToken) -> Result<()> {
        let run_id = run.id.clone();
        let product_ids = self.runs.get_run_products(&run_id).await?;
        if product_ids.is_empty() {
            return Err(Error::InvalidInput(format!("run {run_id} has no products")));
        }

        // Archive the templates once per execution for auditability.
        let templates = self.engine.prompts();
        for (name, body) in [
            (prompts::EXTRACTION_TEMPLATE, &templates.extraction),
            (prompts::CONSOLIDATION_TEMPLATE, &templates.consolidation),
            (prompts::REFINEMENT_TEMPLATE, &templates.refinement),
        ] {
            let prompt_type = name.trim_end_matches(".txt");
            if let Err(e) = self.store.archive_prompt(&run_id, prompt_type, body) {
                tracing::warn!(run_id = %run_id, error = %e, "prompt archive failed");
            }
        }

        let ctx = StageContext {
            run_id: run_id.clone(),
            category: run.product_category.clone(),
            cancel,
            budget: Arc::new(CallBudget::new(
                self.config.limits.max_llm_calls_per_execute,
            )),
        };
        let tracker: Arc<ProgressTracker> = Arc::new(ProgressTracker::new(
            Arc::clone(&self.runs),
            run_id.clone(),
            run.progress,
            run.processed_products,
        ));
        let sink: Arc<dyn ProgressSink> = tracker.clone();

        // Resume from the recorded stage; earlier stages are re-entered
        // from their own outputs in the repositories.
        let consolidation = match run.stage {
            Stage::Init | Stage::Extraction => {
                self.advance(&run_id, run.stage, Stage::Extraction).await?;
                let batch_sets = self
                    .engine
                    .run_extraction(&ctx, &product_ids, Arc::clone(&sink))
                    .await?;

                self.advance(&run_id, Stage::Extraction, Stage::Consolidation)
                    .await?;
                self.engine
                    .run_consolidation(&ctx, batch_sets, Arc::clone(&sink))
                    .await?
            }
            Stage::Consolidation => {
                let batch_sets = self.rebuild_extraction_sets(&run_id).await?;
                self.engine
                    .run_consolidation(&ctx, batch_sets, Arc::clone(&sink))
                    .await?
            }
            Stage::Refinement => self.rebuild_consolidation(&run_id).await?,
            Stage::Completed | Stage::Failed => unreachable!("terminal stages handled earlier"),
        };

        if run.stage != Stage::Refinement {
            self.advance(&run_id, Stage::Consolidation, Stage::Refinement)
                .await?;
        }
        self.engine
            .run_refinement(&ctx, &consolidation, Arc::clone(&sink))
            .await?;

        // Final counters, then the terminal stage with the summary.
        {
            let mut state = tracker.state.lock();
            state.0.seg_batches_done = state.0.seg_batches_total;
            state.0.con_batches_done = state.0.con_batches_total;
            state.0.ref_batches_done = state.0.ref_batches_total;
            state.1 = run.total_products;
        }
        tracker.persist().await;

        let summary = serde_json::json!({
            "total_products": product_ids.len(),
            "taxonomies": consolidation.records.len(),
            "llm_calls": ctx.budget.used(),
        });
        self.runs.complete(&run_id, summary).await?;
        tracing::info!(run_id = %run_id, llm_calls = ctx.budget.used(), "run completed");
        Ok(())
    }

    /// Forward-only stage transition; same-stage re-entry is a no-op.
    async fn advance(&self, run_id: &str, current: Stage, next: Stage) -> Result<()> {
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(Error::Other(format!(
                "illegal stage transition {current} → {next} for run {run_id}"
            )));
        }
        self.runs.update_stage(run_id, next).await
    }

    /// Rebuild consolidation input from persisted extraction taxonomies:
    /// assignment counts restore the per-category product counts, and the
    /// flat list is regrouped into sets bounded by the consolidation size.
    async fn rebuild_extraction_sets(&self, run_id: &str) -> Result<Vec<Vec<TaxonomyDraft>>> {
        let records = self
            .taxonomies
            .by_run_and_stage(run_id, TaxonomyStage::Extraction)
            .await?;
        let assignments = self.assignments.by_run(run_id).await?;

        let mut counts: HashMap<i64, u32> = HashMap::new();
        for assignment in &assignments {
            *counts.entry(assignment.taxonomy_id_initial).or_default() += 1;
        }

        let drafts: Vec<TaxonomyDraft> = records
            .iter()
            .map(|r| TaxonomyDraft {
                segment_name: r.segment_name.clone(),
                definition: r.definition.clone(),
                product_count: counts.get(&r.id).copied().unwrap_or(0),
            })
            .collect();

        let group = self.config.stages.taxonomies_per_consolidation.max(1);
        Ok(drafts.chunks(group).map(|c| c.to_vec()).collect())
    }

    /// Rebuild the consolidation outcome for a run resuming at refinement.
    /// The merge provenance is gone, so extraction segments map to the
    /// consolidated segment of the same name, falling back to the first
    /// consolidated segment.
    async fn rebuild_consolidation(&self, run_id: &str) -> Result<ConsolidationOutcome> {
        let records = self
            .taxonomies
            .by_run_and_stage(run_id, TaxonomyStage::Consolidation)
            .await?;
        let extraction = self
            .taxonomies
            .by_run_and_stage(run_id, TaxonomyStage::Extraction)
            .await?;

        let cons_names: std::collections::HashSet<&str> =
            records.iter().map(|r| r.segment_name.as_str()).collect();
        let fallback = records.first().map(|r| r.segment_name.clone());

        let mut name_map = HashMap::new();
        for ext in &extraction {
            let target = if cons_names.contains(ext.segment_name.as_str()) {
                ext.segment_name.clone()
            } else if let Some(ref fb) = fallback {
                fb.clone()
            } else {
                continue;
            };
            name_map.insert(ext.segment_name.clone(), target);
        }

        Ok(ConsolidationOutcome { records, name_map })
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn get_run(&self, run_id: &str) -> Result<SegmentRun> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<SegmentRun>> {
        self.runs.recent(limit).await
    }

    pub async fn runs_by_stage(&self, stage: Stage) -> Result<Vec<SegmentRun>> {
        self.runs.by_stage(stage).await
    }

    /// Final (or partial, for failed runs) results: the consolidated
    /// taxonomies with derived product counts, plus one segment row per
    /// product carrying its refined taxonomy id — falling back to the
    /// initial one when refinement produced none.
    pub async fn get_results(&self, run_id: &str) -> Result<ResultsView> {
        // 404 for unknown runs, partial data for everything else.
        let _run = self.get_run(run_id).await?;

        let taxonomies = self
            .taxonomies
            .by_run_and_stage(run_id, TaxonomyStage::Consolidation)
            .await?;
        let assignments = self.assignments.by_run(run_id).await?;

        let segments: Vec<SegmentView> = assignments
            .iter()
            .map(|a| SegmentView {
                product_id: a.product_id,
                taxonomy_id: a.effective_taxonomy_id(),
            })
            .collect();

        let mut counts: HashMap<i64, u32> = HashMap::new();
        for segment in &segments {
            *counts.entry(segment.taxonomy_id).or_default() += 1;
        }

        let taxonomies = taxonomies
            .into_iter()
            .map(|t: TaxonomyRecord| TaxonomyView {
                product_count: counts.get(&t.id).copied().unwrap_or(0),
                id: t.id,
                segment_name: t.segment_name,
                definition: t.definition,
            })
            .collect();

        Ok(ResultsView {
            run_id: run_id.to_string(),
            taxonomies,
            segments,
        })
    }
}
