use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter + call budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide rate-limiter caps plus the per-run LLM-call ceiling.
///
/// The three per-minute caps each drive a 60-second sliding window; the
/// concurrency cap drives the admission semaphore.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "d_rpm")]
    pub max_requests_per_minute: u32,
    #[serde(default = "d_tokens_pm")]
    pub max_input_tokens_per_minute: u64,
    #[serde(default = "d_tokens_pm")]
    pub max_output_tokens_per_minute: u64,
    #[serde(default = "d_concurrent")]
    pub max_concurrent_requests: usize,
    /// Hard ceiling on total LLM calls a single run may issue.
    #[serde(default = "d_calls_per_execute")]
    pub max_llm_calls_per_execute: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_requests_per_minute: d_rpm(),
            max_input_tokens_per_minute: d_tokens_pm(),
            max_output_tokens_per_minute: d_tokens_pm(),
            max_concurrent_requests: d_concurrent(),
            max_llm_calls_per_execute: d_calls_per_execute(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_rpm() -> u32 {
    3_000
}
fn d_tokens_pm() -> u64 {
    120_000
}
fn d_concurrent() -> usize {
    100
}
fn d_calls_per_execute() -> u32 {
    500
}
