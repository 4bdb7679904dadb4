use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the chat-completion provider binding. The model, temperature
/// and max-tokens triple is also snapshotted onto each run at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f64,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    /// Base URL of the OpenAI-compatible endpoint.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Env var holding the API key. Resolved at adapter construction.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Admissions per logical call: first with the original prompt, the
    /// second with the caller-built retry prompt.
    #[serde(default = "d_max_attempts")]
    pub max_attempts_per_call: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: d_model(),
            temperature: d_temperature(),
            max_tokens: d_max_tokens(),
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            request_timeout_secs: d_timeout_secs(),
            max_attempts_per_call: d_max_attempts(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_model() -> String {
    "gpt-4o".into()
}
fn d_temperature() -> f64 {
    0.2
}
fn d_max_tokens() -> u32 {
    4096
}
fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_timeout_secs() -> u64 {
    120
}
fn d_max_attempts() -> u32 {
    2
}
