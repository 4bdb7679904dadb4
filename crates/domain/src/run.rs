//! Segmentation run records — the unit of work tracked end to end.
//!
//! A run walks a strict forward-only state machine:
//! `init → extraction → consolidation → refinement → completed`, with
//! `failed` reachable from every non-terminal stage and absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Extraction,
    Consolidation,
    Refinement,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only transition check. `failed` is reachable from any
    /// non-terminal stage; no backward moves, no skipping.
    pub fn can_transition_to(self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Stage::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Stage::Init, Stage::Extraction)
                | (Stage::Extraction, Stage::Consolidation)
                | (Stage::Consolidation, Stage::Refinement)
                | (Stage::Refinement, Stage::Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Extraction => "extraction",
            Self::Consolidation => "consolidation",
            Self::Refinement => "refinement",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "init" => Some(Self::Init),
            "extraction" => Some(Self::Extraction),
            "consolidation" => Some(Self::Consolidation),
            "refinement" => Some(Self::Refinement),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-stage batch counters. Absolute values, never deltas — writes are
/// last-writer-wins and idempotent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressCounters {
    pub seg_batches_done: u32,
    pub seg_batches_total: u32,
    pub con_batches_done: u32,
    pub con_batches_total: u32,
    pub ref_batches_done: u32,
    pub ref_batches_total: u32,
}

impl ProgressCounters {
    /// Stream percent: batches done over batches total across all three
    /// stages, or 0 when no batches are planned yet.
    pub fn percent(&self) -> f64 {
        let done = self.seg_batches_done + self.con_batches_done + self.ref_batches_done;
        let total = self.seg_batches_total + self.con_batches_total + self.ref_batches_total;
        if total == 0 {
            return 0.0;
        }
        let raw = 100.0 * f64::from(done) / f64::from(total);
        // One decimal, matching the stream contract.
        (raw * 10.0).round() / 10.0
    }
}

/// Snapshot of the LLM parameters a run was started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSnapshot {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Batch sizing the run was started with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingParams {
    pub extraction_batch_size: usize,
    pub refinement_batch_size: usize,
}

/// One segmentation run, matching the `product_segment_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRun {
    pub id: String,
    pub stage: Stage,
    pub progress: ProgressCounters,
    pub total_products: u32,
    pub processed_products: u32,
    /// Free-text label embedded verbatim into the extraction prompt.
    pub product_category: String,
    pub llm_config: LlmSnapshot,
    pub processing_params: ProcessingParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SegmentRun {
    pub fn new(
        total_products: u32,
        product_category: String,
        llm_config: LlmSnapshot,
        processing_params: ProcessingParams,
    ) -> Self {
        Self {
            id: generate_run_id(),
            stage: Stage::Init,
            progress: ProgressCounters::default(),
            total_products,
            processed_products: 0,
            product_category,
            llm_config,
            processing_params,
            result_summary: None,
            created_at: Utc::now(),
        }
    }

    pub fn percent(&self) -> f64 {
        self.progress.percent()
    }
}

/// `RUN_<UTC basic timestamp>_<4 hex>` — unique and chronologically sortable.
pub fn generate_run_id() -> String {
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
    let unique = Uuid::new_v4().simple().to_string();
    format!("RUN_{ts}_{}", &unique[..4])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
