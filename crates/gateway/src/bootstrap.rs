//! AppState construction extracted from `main.rs`.
//!
//! [`build_app_state`] wires the full runtime against the real provider;
//! [`build_app_state_with`] accepts an injected provider so tests can run
//! the whole pipeline against stubs and a relaxed limiter.

use std::sync::Arc;

use anyhow::Context;

use ps_domain::config::{Config, ConfigSeverity};
use ps_engine::prompts::PromptSet;
use ps_providers::{LlmProvider, OpenAiCompatProvider};
use ps_store::{
    BlobStore, Database, InteractionStore, SqliteAssignmentRepository,
    SqliteInteractionIndexRepository, SqliteProductCatalog, SqliteRunRepository,
    SqliteTaxonomyRepository,
};

use crate::runtime::limiter::RateLimiter;
use crate::runtime::llm::LlmGateway;
use crate::runtime::orchestrator::SegmentationService;
use crate::runtime::stages::StageEngine;
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`] using the OpenAI-compatible provider binding.
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let provider: Arc<dyn LlmProvider> = Arc::new(
        OpenAiCompatProvider::from_settings(&config.llm)
            .context("initializing LLM provider")?,
    );
    build_app_state_with(config, provider)
}

/// Same wiring with an injected provider (tests, alternative bindings).
pub fn build_app_state_with(
    config: Arc<Config>,
    provider: Arc<dyn LlmProvider>,
) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Prompt templates (fail fast on missing files) ────────────────
    let prompts = Arc::new(
        PromptSet::load(&config.storage.prompt_dir).context("loading prompt templates")?,
    );
    tracing::info!(dir = %config.storage.prompt_dir.display(), "prompt templates loaded");

    // ── Database + repositories ──────────────────────────────────────
    let db = Arc::new(Database::open(&config.storage.db_path).context("opening database")?);
    let runs = Arc::new(SqliteRunRepository::new(Arc::clone(&db)));
    let taxonomies = Arc::new(SqliteTaxonomyRepository::new(Arc::clone(&db)));
    let assignments = Arc::new(SqliteAssignmentRepository::new(Arc::clone(&db)));
    let interactions = Arc::new(SqliteInteractionIndexRepository::new(Arc::clone(&db)));
    let catalog = Arc::new(SqliteProductCatalog::new(Arc::clone(&db)));

    // ── Interaction store (blob + index) ─────────────────────────────
    let blobs = BlobStore::new(config.storage.storage_root.clone())
        .context("initializing blob store")?;
    let store = Arc::new(InteractionStore::new(blobs, interactions));
    tracing::info!(root = %config.storage.storage_root.display(), "interaction store ready");

    // ── Rate limiter + gateway (process-wide) ────────────────────────
    let limiter = Arc::new(RateLimiter::new(&config.limits, config.llm.max_tokens));
    let gateway = Arc::new(LlmGateway::new(
        provider,
        limiter,
        Arc::clone(&store),
        config.llm.clone(),
    ));
    tracing::info!(
        rpm = config.limits.max_requests_per_minute,
        concurrent = config.limits.max_concurrent_requests,
        "rate-limited LLM gateway ready"
    );

    // ── Stage engine + orchestrator ──────────────────────────────────
    let engine = Arc::new(StageEngine::new(
        gateway,
        prompts,
        catalog,
        taxonomies.clone(),
        assignments.clone(),
        config.stages,
        config.llm.clone(),
    ));
    let service = Arc::new(SegmentationService::new(
        Arc::clone(&config),
        runs,
        taxonomies,
        assignments,
        engine,
        store,
    ));

    Ok(AppState { config, service })
}
