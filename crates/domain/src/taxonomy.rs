//! Taxonomies and assignments — the output side of a run.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which pipeline pass produced a taxonomy row. Per-batch taxonomies carry
/// `Extraction`; the final merged set carries `Consolidation`. Both coexist
/// within a run — the consolidation set is the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomyStage {
    Extraction,
    Consolidation,
}

impl TaxonomyStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Consolidation => "consolidation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(Self::Extraction),
            "consolidation" => Some(Self::Consolidation),
            _ => None,
        }
    }
}

/// A taxonomy not yet persisted — name, definition, and how many products
/// the producing LLM pass put into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyDraft {
    pub segment_name: String,
    pub definition: String,
    pub product_count: u32,
}

/// A persisted taxonomy row (`product_segment_taxonomies`). The surrogate
/// `id` is allocated by the repository; cross-stage references use it only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyRecord {
    pub id: i64,
    pub run_id: String,
    pub segment_name: String,
    pub definition: String,
    pub stage: TaxonomyStage,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assignment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Exactly one row per (run, product). `taxonomy_id_initial` references a
/// stage=extraction taxonomy of the same run; `taxonomy_id_refined` a
/// stage=consolidation one. On completed runs both are populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: String,
    pub product_id: i64,
    pub taxonomy_id_initial: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxonomy_id_refined: Option<i64>,
}

impl Assignment {
    /// The taxonomy id downstream consumers should use: the refined one,
    /// falling back to the initial assignment when refinement produced none.
    pub fn effective_taxonomy_id(&self) -> i64 {
        self.taxonomy_id_refined.unwrap_or(self.taxonomy_id_initial)
    }
}
