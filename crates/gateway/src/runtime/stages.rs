//! Stage engine — drives the three LLM passes over a run.
//!
//! One engine serves all three stages; each stage supplies its prompt
//! rendering, validator, and persistence while the fan-out, retry, and
//! budget mechanics stay shared. Batches of a stage execute concurrently;
//! the rate limiter is the only throttle. Split-and-retry is extraction
//! only: a batch that fails both attempts is halved and the halves run
//! concurrently under a structured join.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::task::JoinSet;

use ps_domain::config::{LlmSettings, StageSettings};
use ps_domain::error::{Error, Result};
use ps_domain::interaction::InteractionKind;
use ps_domain::taxonomy::{TaxonomyDraft, TaxonomyRecord, TaxonomyStage};
use ps_engine::batching::make_batches;
use ps_engine::merge::{apply_consolidation, merge_drafts};
use ps_engine::prompts::{
    self, PromptSet, RefinementProduct, SegmentIndex,
};
use ps_engine::validation::{
    self, ConsolidationMap, ExtractionMap, RefinementMap,
};
use ps_store::{title_or_placeholder, AssignmentRepository, CacheContext, ProductCatalog, TaxonomyRepository};

use super::cancel::CancelToken;
use super::llm::{CallBudget, CallSpec, LlmGateway};

/// Bucket name the extraction prompt may use for products outside the
/// category. Not persisted as a taxonomy unless it is the only segment;
/// its products fall back to the batch's largest segment.
const OUT_OF_SCOPE: &str = "OUT_OF_SCOPE";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context + progress sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run call context threaded through every batch task.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub category: String,
    pub cancel: CancelToken,
    pub budget: Arc<CallBudget>,
}

/// Progress notifications, invoked sequentially from the stage's collector
/// loop so counts are monotonic by construction.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn extraction_batch_done(&self, batches_done: u32, products_done: u32);
    async fn consolidation_merge_done(&self, merges_done: u32);
    async fn refinement_batch_done(&self, batches_done: u32);
}

/// Result of the consolidation stage: the persisted final taxonomy plus
/// the mapping from extraction segment names to consolidated names.
pub struct ConsolidationOutcome {
    pub records: Vec<TaxonomyRecord>,
    pub name_map: HashMap<String, String>,
}

/// A taxonomy set moving through the merge tournament, with the
/// extraction-level names folded into each category.
struct WorkingSet {
    drafts: Vec<TaxonomyDraft>,
    origins: Vec<Vec<String>>,
}

impl WorkingSet {
    fn seed(drafts: Vec<TaxonomyDraft>) -> Self {
        let origins = drafts
            .iter()
            .map(|d| vec![d.segment_name.clone()])
            .collect();
        Self { drafts, origins }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StageEngine {
    gateway: Arc<LlmGateway>,
    prompts: Arc<PromptSet>,
    catalog: Arc<dyn ProductCatalog>,
    taxonomies: Arc<dyn TaxonomyRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    stages: StageSettings,
    llm: LlmSettings,
}

impl StageEngine {
    pub fn new(
        gateway: Arc<LlmGateway>,
        prompts: Arc<PromptSet>,
        catalog: Arc<dyn ProductCatalog>,
        taxonomies: Arc<dyn TaxonomyRepository>,
        assignments: Arc<dyn AssignmentRepository>,
        stages: StageSettings,
        llm: LlmSettings,
    ) -> Self {
        Self {
            gateway,
            prompts,
            catalog,
            taxonomies,
            assignments,
            stages,
            llm,
        }
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    fn base_context(&self) -> CacheContext {
        let mut ctx = CacheContext::new();
        ctx.insert("model".into(), serde_json::json!(self.llm.model));
        ctx.insert("temperature".into(), serde_json::json!(self.llm.temperature));
        ctx
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Extraction
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run the extraction pass: batch the products, call the LLM per batch
    /// concurrently, persist per-batch taxonomies and initial assignments.
    /// Returns the per-batch taxonomy drafts, in batch order, as input for
    /// consolidation.
    pub async fn run_extraction(
        self: &Arc<Self>,
        ctx: &StageContext,
        product_ids: &[i64],
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Vec<Vec<TaxonomyDraft>>> {
        let titles = Arc::new(self.catalog.titles(product_ids).await?);
        let batches = make_batches(
            product_ids,
            self.stages.products_per_taxonomy_prompt,
            self.stages.batch_seed,
        );
        tracing::info!(
            run_id = %ctx.run_id,
            products = product_ids.len(),
            batches = batches.len(),
            "extraction starting"
        );

        let mut join_set = JoinSet::new();
        for (idx, batch) in batches.iter().enumerate() {
            let engine = Arc::clone(self);
            let ctx = ctx.clone();
            let titles = Arc::clone(&titles);
            let batch = batch.clone();
            let batch_no = (idx + 1) as u32;
            join_set.spawn(async move {
                let len = batch.len();
                engine
                    .extraction_batch(ctx, batch_no, batch, titles)
                    .await
                    .map(|drafts| (batch_no, drafts, len))
            });
        }

        let mut sets: Vec<Option<Vec<TaxonomyDraft>>> = vec![None; batches.len()];
        let mut done: u32 = 0;
        let mut processed: u32 = 0;
        let mut first_error: Option<Error> = None;

        while let Some(joined) = join_set.join_next().await {
            let result = joined.map_err(|e| Error::Other(format!("extraction task join: {e}")))?;
            match result {
                Ok((batch_no, drafts, len)) => {
                    sets[(batch_no - 1) as usize] = Some(drafts);
                    done += 1;
                    processed += len as u32;
                    sink.extraction_batch_done(done, processed).await;
                }
                Err(e) if first_error.is_none() => {
                    // Abandon siblings; the run is failing anyway.
                    ctx.cancel.cancel();
                    first_error = Some(e);
                }
                Err(_) => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(sets.into_iter().flatten().collect()),
        }
    }

    /// One extraction batch, recursive for split-and-retry. On a failed
    /// call the batch is halved and both halves run concurrently; their
    /// taxonomies fold back together by name. A failing singleton
    /// propagates the error and fails the run.
    fn extraction_batch(
        self: Arc<Self>,
        ctx: StageContext,
        batch_no: u32,
        products: Vec<i64>,
        titles: Arc<HashMap<i64, String>>,
    ) -> BoxFuture<'static, Result<Vec<TaxonomyDraft>>> {
        Box::pin(async move {
            let title_list: Vec<String> = products
                .iter()
                .map(|id| title_or_placeholder(&titles, *id))
                .collect();
            let batch_len = products.len();

            let template = self.prompts.extraction.clone();
            let category = ctx.category.clone();
            let retry_titles = title_list.clone();

            let call = CallSpec {
                run_id: ctx.run_id.clone(),
                kind: InteractionKind::Extraction,
                batch_id: batch_no,
                context: self.base_context(),
                prompt: prompts::render_extraction(&template, &category, &title_list),
                validate: Box::new(move |text| {
                    validation::validate_extraction(text, batch_len)
                        .map(|map| serde_json::to_value(map).unwrap_or_default())
                }),
                build_retry_prompt: Box::new(move |diag| {
                    prompts::render_extraction_retry(
                        &template,
                        &category,
                        &retry_titles,
                        &diag.as_retry_section(),
                    )
                }),
            };

            match self.gateway.call(call, &ctx.budget, &ctx.cancel).await {
                Ok(outcome) => {
                    let map: ExtractionMap = serde_json::from_value(outcome.parsed)?;
                    self.persist_extraction(&ctx, &products, &map).await
                }
                Err(e @ (Error::LlmCall(_) | Error::StageProtocol(_)))
                    if batch_len > 1 && !ctx.cancel.is_cancelled() =>
                {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        batch = batch_no,
                        size = batch_len,
                        error = %e,
                        "splitting failed extraction batch"
                    );
                    let mid = batch_len / 2;
                    let left = products[..mid].to_vec();
                    let right = products[mid..].to_vec();

                    let (left_result, right_result) = tokio::join!(
                        Arc::clone(&self).extraction_batch(
                            ctx.clone(),
                            batch_no,
                            left,
                            Arc::clone(&titles)
                        ),
                        Arc::clone(&self).extraction_batch(
                            ctx.clone(),
                            batch_no,
                            right,
                            Arc::clone(&titles)
                        ),
                    );
                    let mut combined = left_result?;
                    combined.extend(right_result?);
                    Ok(merge_drafts(&combined))
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Persist one batch's taxonomies and initial assignments. Taxonomies
    /// first, so assignments reference repository-allocated ids.
    async fn persist_extraction(
        &self,
        ctx: &StageContext,
        products: &[i64],
        map: &ExtractionMap,
    ) -> Result<Vec<TaxonomyDraft>> {
        let out_of_scope = map.get(OUT_OF_SCOPE);
        let kept: Vec<(&String, &validation::SegmentEntry)> = map
            .iter()
            .filter(|(name, _)| name.as_str() != OUT_OF_SCOPE || map.len() == 1)
            .collect();

        let largest_name = kept
            .iter()
            .max_by_key(|(_, entry)| entry.ids.len())
            .map(|(name, _)| (*name).clone())
            .ok_or_else(|| Error::StageProtocol("extraction produced no segments".into()))?;

        let mut drafts: Vec<TaxonomyDraft> = kept
            .iter()
            .map(|(name, entry)| TaxonomyDraft {
                segment_name: (*name).clone(),
                definition: entry.definition.clone(),
                product_count: entry.ids.len() as u32,
            })
            .collect();
        if let Some(oos) = out_of_scope {
            if map.len() > 1 {
                if let Some(largest) = drafts.iter_mut().find(|d| d.segment_name == largest_name) {
                    largest.product_count += oos.ids.len() as u32;
                }
            }
        }

        let mapping = self
            .taxonomies
            .upsert_batch(&ctx.run_id, TaxonomyStage::Extraction, &drafts)
            .await?;
        let id_by_name: HashMap<&str, i64> =
            mapping.iter().map(|(n, id)| (n.as_str(), *id)).collect();

        let mut pairs: Vec<(i64, i64)> = Vec::with_capacity(products.len());
        for (name, entry) in &kept {
            let taxonomy_id = id_by_name[name.as_str()];
            for idx in &entry.ids {
                pairs.push((products[*idx], taxonomy_id));
            }
        }
        if let Some(oos) = out_of_scope {
            if map.len() > 1 {
                let fallback_id = id_by_name[largest_name.as_str()];
                for idx in &oos.ids {
                    pairs.push((products[*idx], fallback_id));
                }
            }
        }
        self.assignments.upsert_initial(&ctx.run_id, &pairs).await?;

        Ok(drafts)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Consolidation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Merge the per-batch taxonomy sets into one consolidated taxonomy
    /// via a pairwise tournament. Pairs of one level merge concurrently;
    /// an odd set passes through to the next level. Zero or one input
    /// sets pass through without any LLM call.
    pub async fn run_consolidation(
        self: &Arc<Self>,
        ctx: &StageContext,
        batch_sets: Vec<Vec<TaxonomyDraft>>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<ConsolidationOutcome> {
        let mut working: Vec<WorkingSet> = batch_sets
            .into_iter()
            .filter(|set| !set.is_empty())
            .map(WorkingSet::seed)
            .collect();

        if working.is_empty() {
            return Ok(ConsolidationOutcome {
                records: Vec::new(),
                name_map: HashMap::new(),
            });
        }

        let merge_counter = Arc::new(AtomicU32::new(0));
        let mut merges_done: u32 = 0;

        while working.len() > 1 {
            let pair_count = working.len() / 2;
            let mut next: Vec<Option<WorkingSet>> = (0..pair_count).map(|_| None).collect();
            let mut leftover: Option<WorkingSet> = None;

            let mut join_set = JoinSet::new();
            let mut iter = working.into_iter();
            let mut slot = 0usize;
            while let Some(a) = iter.next() {
                match iter.next() {
                    Some(b) => {
                        let engine = Arc::clone(self);
                        let ctx = ctx.clone();
                        let merge_no = merge_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        let this_slot = slot;
                        join_set.spawn(async move {
                            engine
                                .merge_pair(ctx, merge_no, a, b)
                                .await
                                .map(|merged| (this_slot, merged))
                        });
                        slot += 1;
                    }
                    None => leftover = Some(a),
                }
            }

            let mut first_error: Option<Error> = None;
            while let Some(joined) = join_set.join_next().await {
                let result =
                    joined.map_err(|e| Error::Other(format!("consolidation task join: {e}")))?;
                match result {
                    Ok((slot, merged)) => {
                        next[slot] = Some(merged);
                        merges_done += 1;
                        sink.consolidation_merge_done(merges_done).await;
                    }
                    Err(e) if first_error.is_none() => {
                        ctx.cancel.cancel();
                        first_error = Some(e);
                    }
                    Err(_) => {}
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            let mut level: Vec<WorkingSet> = next.into_iter().flatten().collect();
            if let Some(set) = leftover {
                level.push(set);
            }
            working = level;
        }

        let final_set = working.pop().expect("tournament leaves one set");
        let mapping = self
            .taxonomies
            .upsert_batch(&ctx.run_id, TaxonomyStage::Consolidation, &final_set.drafts)
            .await?;
        tracing::info!(
            run_id = %ctx.run_id,
            categories = mapping.len(),
            merges = merges_done,
            "consolidation complete"
        );

        let mut name_map = HashMap::new();
        for (draft, origins) in final_set.drafts.iter().zip(&final_set.origins) {
            for origin in origins {
                name_map.insert(origin.clone(), draft.segment_name.clone());
            }
        }

        let records = self
            .taxonomies
            .by_run_and_stage(&ctx.run_id, TaxonomyStage::Consolidation)
            .await?;
        Ok(ConsolidationOutcome { records, name_map })
    }

    /// One pair merge: render both halves with synthetic provenance ids,
    /// call the LLM, translate the validated response back into drafts.
    async fn merge_pair(
        self: Arc<Self>,
        ctx: StageContext,
        merge_no: u32,
        a: WorkingSet,
        b: WorkingSet,
    ) -> Result<WorkingSet> {
        let expected: BTreeSet<String> = prompts::synthetic_ids('A', a.drafts.len())
            .into_iter()
            .chain(prompts::synthetic_ids('B', b.drafts.len()))
            .collect();

        let template = self.prompts.consolidation.clone();
        let drafts_a = a.drafts.clone();
        let drafts_b = b.drafts.clone();
        let retry_a = drafts_a.clone();
        let retry_b = drafts_b.clone();
        let expected_for_validate = expected.clone();

        let call = CallSpec {
            run_id: ctx.run_id.clone(),
            kind: InteractionKind::Consolidation,
            batch_id: merge_no,
            context: self.base_context(),
            prompt: prompts::render_consolidation(&template, &drafts_a, &drafts_b),
            validate: Box::new(move |text| {
                validation::validate_consolidation(text, &expected_for_validate)
                    .map(|map| serde_json::to_value(map).unwrap_or_default())
            }),
            build_retry_prompt: Box::new(move |diag| {
                prompts::render_consolidation_retry(
                    &template,
                    &retry_a,
                    &retry_b,
                    &diag.as_retry_section(),
                )
            }),
        };

        let outcome = self.gateway.call(call, &ctx.budget, &ctx.cancel).await?;
        let merged: ConsolidationMap = serde_json::from_value(outcome.parsed)?;

        let drafts = apply_consolidation(&a.drafts, &b.drafts, &merged);
        let origin_of = |id: &str| -> Vec<String> {
            let Some((prefix, idx)) = id.split_once('_') else {
                return Vec::new();
            };
            let Ok(idx) = idx.parse::<usize>() else {
                return Vec::new();
            };
            match prefix {
                "A" => a.origins.get(idx).cloned().unwrap_or_default(),
                "B" => b.origins.get(idx).cloned().unwrap_or_default(),
                _ => Vec::new(),
            }
        };
        // Same BTreeMap iteration order as apply_consolidation.
        let origins: Vec<Vec<String>> = merged
            .values()
            .map(|entry| entry.ids.iter().flat_map(|id| origin_of(id)).collect())
            .collect();

        Ok(WorkingSet { drafts, origins })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Refinement
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Revisit the extraction-time assignments now that the consolidated
    /// taxonomy is known. Missing response keys keep the current segment;
    /// there is no split here — a batch that fails both attempts fails
    /// the stage.
    pub async fn run_refinement(
        self: &Arc<Self>,
        ctx: &StageContext,
        consolidation: &ConsolidationOutcome,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        if consolidation.records.is_empty() {
            tracing::info!(run_id = %ctx.run_id, "no consolidated taxonomy, skipping refinement");
            return Ok(());
        }
        let assignments = self.assignments.by_run(&ctx.run_id).await?;
        if assignments.is_empty() {
            return Ok(());
        }

        // Current consolidated segment per product: extraction taxonomy id
        // → extraction name → consolidated name → consolidated id.
        let extraction_records = self
            .taxonomies
            .by_run_and_stage(&ctx.run_id, TaxonomyStage::Extraction)
            .await?;
        let ext_name_by_id: HashMap<i64, &str> = extraction_records
            .iter()
            .map(|r| (r.id, r.segment_name.as_str()))
            .collect();
        let cons_id_by_name: HashMap<&str, i64> = consolidation
            .records
            .iter()
            .map(|r| (r.segment_name.as_str(), r.id))
            .collect();
        let fallback_id = consolidation.records[0].id;
        let current_of = |initial_taxonomy_id: i64| -> i64 {
            ext_name_by_id
                .get(&initial_taxonomy_id)
                .and_then(|ext_name| consolidation.name_map.get(*ext_name))
                .and_then(|cons_name| cons_id_by_name.get(cons_name.as_str()).copied())
                .unwrap_or_else(|| {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        taxonomy_id = initial_taxonomy_id,
                        "no consolidated counterpart for extraction segment, using fallback"
                    );
                    fallback_id
                })
        };

        let product_ids: Vec<i64> = assignments.iter().map(|a| a.product_id).collect();
        let titles = self.catalog.titles(&product_ids).await?;
        let products: Vec<RefinementProduct> = assignments
            .iter()
            .map(|a| RefinementProduct {
                product_id: a.product_id,
                title: title_or_placeholder(&titles, a.product_id),
                current_taxonomy_id: current_of(a.taxonomy_id_initial),
            })
            .collect();

        let index = Arc::new(SegmentIndex::build(&consolidation.records));
        let taxonomy_names: Vec<&str> = consolidation
            .records
            .iter()
            .map(|r| r.segment_name.as_str())
            .collect();
        let mut context = self.base_context();
        context.insert("taxonomy_names".into(), serde_json::json!(taxonomy_names));

        let batches = make_batches(
            &products,
            self.stages.products_per_refinement,
            self.stages.batch_seed,
        );
        tracing::info!(
            run_id = %ctx.run_id,
            products = products.len(),
            batches = batches.len(),
            "refinement starting"
        );

        let mut join_set = JoinSet::new();
        for (idx, batch) in batches.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let ctx = ctx.clone();
            let index = Arc::clone(&index);
            let context = context.clone();
            let batch_no = (idx + 1) as u32;
            join_set.spawn(async move {
                engine
                    .refinement_batch(ctx, batch_no, batch, index, context)
                    .await
            });
        }

        let mut done: u32 = 0;
        let mut first_error: Option<Error> = None;
        while let Some(joined) = join_set.join_next().await {
            let result = joined.map_err(|e| Error::Other(format!("refinement task join: {e}")))?;
            match result {
                Ok(()) => {
                    done += 1;
                    sink.refinement_batch_done(done).await;
                }
                Err(e) if first_error.is_none() => {
                    ctx.cancel.cancel();
                    first_error = Some(e);
                }
                Err(_) => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn refinement_batch(
        self: Arc<Self>,
        ctx: StageContext,
        batch_no: u32,
        batch: Vec<RefinementProduct>,
        index: Arc<SegmentIndex>,
        context: CacheContext,
    ) -> Result<()> {
        let (products_block, product_by_label) = prompts::products_section(&batch, &index);
        let batch_labels: BTreeSet<String> = product_by_label.keys().cloned().collect();
        let segment_labels: BTreeSet<String> = index.id_by_label.keys().cloned().collect();

        let template = self.prompts.refinement.clone();
        let retry_index = Arc::clone(&index);
        let retry_block = products_block.clone();

        let call = CallSpec {
            run_id: ctx.run_id.clone(),
            kind: InteractionKind::Refinement,
            batch_id: batch_no,
            context,
            prompt: prompts::render_refinement(&template, &index, &products_block),
            validate: Box::new(move |text| {
                validation::validate_refinement(text, &batch_labels, &segment_labels)
                    .map(|map| serde_json::to_value(map).unwrap_or_default())
            }),
            build_retry_prompt: Box::new(move |diag| {
                prompts::render_refinement_retry(
                    &template,
                    &retry_index,
                    &retry_block,
                    &diag.as_retry_section(),
                )
            }),
        };

        let outcome = self.gateway.call(call, &ctx.budget, &ctx.cancel).await?;
        let reassignments: RefinementMap = serde_json::from_value(outcome.parsed)?;

        // Missing keys keep the current segment.
        let pairs: Vec<(i64, i64)> = batch
            .iter()
            .enumerate()
            .map(|(i, product)| {
                let label = format!("P_{i}");
                let refined = reassignments
                    .get(&label)
                    .and_then(|s_label| index.id_by_label.get(s_label).copied())
                    .unwrap_or(product.current_taxonomy_id);
                (product.product_id, refined)
            })
            .collect();
        self.assignments.set_refined(&ctx.run_id, &pairs).await
    }
}
