use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage batch sizing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-stage batch sizes and the seed for the deterministic shuffle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageSettings {
    /// Products per extraction LLM call.
    #[serde(default = "d_40")]
    pub products_per_taxonomy_prompt: usize,
    /// Taxonomy categories per consolidation merge input half.
    #[serde(default = "d_20")]
    pub taxonomies_per_consolidation: usize,
    /// Product assignments per refinement LLM call.
    #[serde(default = "d_40")]
    pub products_per_refinement: usize,
    /// Seed for the batching shuffle; fixed so partitions are reproducible.
    #[serde(default = "d_seed")]
    pub batch_seed: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            products_per_taxonomy_prompt: d_40(),
            taxonomies_per_consolidation: d_20(),
            products_per_refinement: d_40(),
            batch_seed: d_seed(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_40() -> usize {
    40
}
fn d_20() -> usize {
    20
}
fn d_seed() -> u64 {
    42
}
