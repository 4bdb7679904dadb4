//! Engine configuration.
//!
//! Serde structs with defaults; [`Config::from_env`] overlays the
//! environment variables documented in the README onto the defaults.
//! [`Config::validate`] returns structured issues instead of panicking so
//! the binary can decide what is fatal.

mod limits;
mod llm;
mod server;
mod stages;
mod storage;

pub use limits::LimitSettings;
pub use llm::LlmSettings;
pub use server::ServerSettings;
pub use stages::StageSettings;
pub use storage::StorageSettings;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Root config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub stages: StageSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Config {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        env_override("PS_BIND_ADDR", &mut cfg.server.bind_addr);
        env_override("LLM_MODEL_NAME", &mut cfg.llm.model);
        env_parse("LLM_TEMPERATURE", &mut cfg.llm.temperature);
        env_parse("LLM_MAX_TOKENS", &mut cfg.llm.max_tokens);
        env_override("LLM_BASE_URL", &mut cfg.llm.base_url);
        env_override("LLM_API_KEY_ENV", &mut cfg.llm.api_key_env);
        env_parse("MAX_ATTEMPTS_PER_CALL", &mut cfg.llm.max_attempts_per_call);

        env_parse(
            "MAX_REQUESTS_PER_MINUTE",
            &mut cfg.limits.max_requests_per_minute,
        );
        env_parse(
            "MAX_INPUT_TOKENS_PER_MINUTE",
            &mut cfg.limits.max_input_tokens_per_minute,
        );
        env_parse(
            "MAX_OUTPUT_TOKENS_PER_MINUTE",
            &mut cfg.limits.max_output_tokens_per_minute,
        );
        env_parse(
            "MAX_CONCURRENT_REQUESTS",
            &mut cfg.limits.max_concurrent_requests,
        );
        env_parse(
            "MAX_LLM_CALLS_PER_EXECUTE",
            &mut cfg.limits.max_llm_calls_per_execute,
        );

        env_parse(
            "PRODUCTS_PER_TAXONOMY_PROMPT",
            &mut cfg.stages.products_per_taxonomy_prompt,
        );
        env_parse(
            "TAXONOMIES_PER_CONSOLIDATION",
            &mut cfg.stages.taxonomies_per_consolidation,
        );
        env_parse(
            "PRODUCTS_PER_REFINEMENT",
            &mut cfg.stages.products_per_refinement,
        );

        env_path("STORAGE_ROOT", &mut cfg.storage.storage_root);
        env_path("PS_DB_PATH", &mut cfg.storage.db_path);
        env_path("PS_PROMPT_DIR", &mut cfg.storage.prompt_dir);

        cfg
    }

    /// Structural validation. Errors are fatal at startup; warnings are
    /// logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.stages.products_per_taxonomy_prompt == 0 {
            issues.push(ConfigIssue::error(
                "stages.products_per_taxonomy_prompt",
                "extraction batch size must be positive",
            ));
        }
        if self.stages.products_per_refinement == 0 {
            issues.push(ConfigIssue::error(
                "stages.products_per_refinement",
                "refinement batch size must be positive",
            ));
        }
        if self.limits.max_concurrent_requests == 0 {
            issues.push(ConfigIssue::error(
                "limits.max_concurrent_requests",
                "concurrency gate needs at least one slot",
            ));
        }
        if self.llm.max_attempts_per_call == 0 {
            issues.push(ConfigIssue::error(
                "llm.max_attempts_per_call",
                "at least one attempt per call is required",
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            issues.push(ConfigIssue::warning(
                "llm.temperature",
                "temperature outside the usual 0.0–2.0 range",
            ));
        }
        if self.limits.max_llm_calls_per_execute == 0 {
            issues.push(ConfigIssue::warning(
                "limits.max_llm_calls_per_execute",
                "a zero call budget will fail every run immediately",
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ── env helpers ─────────────────────────────────────────────────────

fn env_override(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_path(key: &str, target: &mut PathBuf) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *target = PathBuf::from(v);
        }
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(%key, value = %v, "ignoring unparseable env override"),
        }
    }
}
