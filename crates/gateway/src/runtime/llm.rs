//! Rate-limited LLM call gateway.
//!
//! Every logical pipeline call goes through [`LlmGateway::call`]:
//! cache lookup first, then admission through the rate limiter, the
//! provider call, validation, and persistence of the validated interaction.
//! A call gets at most `max_attempts_per_call` admissions — the first with
//! the original prompt, later ones with the caller-built retry prompt
//! carrying the validator's diagnostic. Listeners receive structured
//! events on every attempt.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;

use ps_domain::config::LlmSettings;
use ps_domain::error::{Error, Result};
use ps_domain::interaction::{InteractionKind, InteractionRecord};
use ps_engine::validation::Diagnostic;
use ps_providers::tokens::estimate_tokens;
use ps_providers::{CompletionRequest, LlmProvider};
use ps_store::{cache_key, CacheContext, InteractionStore};

use super::cancel::CancelToken;
use super::limiter::RateLimiter;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run ceiling on provider calls. Cache hits are free; every admission
/// against the provider is charged, including retries.
pub struct CallBudget {
    limit: u32,
    used: AtomicU32,
}

impl CallBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: AtomicU32::new(0),
        }
    }

    pub fn charge(&self) -> Result<()> {
        let used = self.used.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.limit {
            return Err(Error::CallBudgetExceeded(format!(
                "{used} calls issued, limit {}",
                self.limit
            )));
        }
        Ok(())
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    Transport,
    Validation,
}

/// Structured notifications for listeners, one per attempt outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LlmEvent {
    Success {
        run_id: String,
        kind: InteractionKind,
        batch_id: u32,
        attempt: u32,
        cached: bool,
        latency_ms: u64,
        input_tokens: u32,
        output_tokens: u32,
    },
    AttemptError {
        run_id: String,
        kind: InteractionKind,
        batch_id: u32,
        attempt: u32,
        error_kind: AttemptErrorKind,
        detail: String,
    },
    Error {
        run_id: String,
        kind: InteractionKind,
        batch_id: u32,
        attempts: u32,
        detail: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call spec / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validator: raw response text → parsed payload or diagnostic.
pub type Validator =
    Box<dyn Fn(&str) -> std::result::Result<serde_json::Value, Diagnostic> + Send + Sync>;

/// Retry-prompt constructor: diagnostic context → next-attempt prompt.
pub type RetryPromptBuilder = Box<dyn Fn(&Diagnostic) -> String + Send + Sync>;

pub struct CallSpec {
    pub run_id: String,
    pub kind: InteractionKind,
    /// Sequential within the stage, 1-based.
    pub batch_id: u32,
    /// Context folded into the cache key (model, temperature, …).
    pub context: CacheContext,
    pub prompt: String,
    pub validate: Validator,
    pub build_retry_prompt: RetryPromptBuilder,
}

#[derive(Debug)]
pub struct CallOutcome {
    pub parsed: serde_json::Value,
    pub raw_text: String,
    /// True when the response came from the interaction store.
    pub cached: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    limiter: Arc<RateLimiter>,
    store: Arc<InteractionStore>,
    settings: LlmSettings,
    events: broadcast::Sender<LlmEvent>,
}

impl LlmGateway {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        limiter: Arc<RateLimiter>,
        store: Arc<InteractionStore>,
        settings: LlmSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            provider,
            limiter,
            store,
            settings,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LlmEvent> {
        self.events.subscribe()
    }

    pub fn interaction_store(&self) -> &Arc<InteractionStore> {
        &self.store
    }

    fn emit(&self, event: LlmEvent) {
        let _ = self.events.send(event);
    }

    /// Execute one logical LLM call with caching, rate limiting, retries
    /// and validation.
    pub async fn call(
        &self,
        spec: CallSpec,
        budget: &CallBudget,
        cancel: &CancelToken,
    ) -> Result<CallOutcome> {
        let max_attempts = self.settings.max_attempts_per_call.max(1);
        let mut current_prompt = spec.prompt.clone();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "{} batch {} abandoned",
                    spec.kind, spec.batch_id
                )));
            }

            let key = cache_key(&current_prompt, &spec.context);

            // Lookup-before-call: a stored interaction that still validates
            // short-circuits the provider entirely.
            if let Some(hit) = self.store.lookup(&key).await? {
                match (spec.validate)(&hit.record.response_text) {
                    Ok(parsed) => {
                        if hit.entry.run_id != spec.run_id {
                            self.store
                                .record_replay(&hit, &spec.run_id, spec.batch_id, &key)
                                .await?;
                        }
                        self.emit(LlmEvent::Success {
                            run_id: spec.run_id.clone(),
                            kind: spec.kind,
                            batch_id: spec.batch_id,
                            attempt,
                            cached: true,
                            latency_ms: 0,
                            input_tokens: hit.record.input_tokens,
                            output_tokens: hit.record.output_tokens,
                        });
                        return Ok(CallOutcome {
                            parsed,
                            raw_text: hit.record.response_text,
                            cached: true,
                        });
                    }
                    Err(_) => {
                        tracing::warn!(
                            cache_key = %key,
                            "cached response no longer validates in this context, calling provider"
                        );
                    }
                }
            }

            budget.charge()?;

            let est_input = estimate_tokens(&current_prompt);
            let permit = self.limiter.acquire(est_input, cancel).await?;
            let started = Instant::now();

            let response = self
                .provider
                .complete(CompletionRequest {
                    prompt: current_prompt.clone(),
                    model: None,
                    temperature: self.settings.temperature,
                    max_tokens: self.settings.max_tokens,
                })
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    // Semaphore slot is released by the permit drop; token
                    // reservations stay as best-estimate.
                    drop(permit);
                    self.emit(LlmEvent::AttemptError {
                        run_id: spec.run_id.clone(),
                        kind: spec.kind,
                        batch_id: spec.batch_id,
                        attempt,
                        error_kind: AttemptErrorKind::Transport,
                        detail: e.to_string(),
                    });
                    if attempt == max_attempts {
                        self.emit(LlmEvent::Error {
                            run_id: spec.run_id.clone(),
                            kind: spec.kind,
                            batch_id: spec.batch_id,
                            attempts: attempt,
                            detail: e.to_string(),
                        });
                        return Err(Error::LlmCall(format!(
                            "{} batch {} failed after {attempt} attempts: {e}",
                            spec.kind, spec.batch_id
                        )));
                    }
                    continue;
                }
            };

            let latency_ms = started.elapsed().as_millis() as u64;
            let input_tokens = response
                .usage
                .map(|u| u.input_tokens)
                .unwrap_or(est_input as u32);
            let output_tokens = response
                .usage
                .map(|u| u.output_tokens)
                .unwrap_or_else(|| estimate_tokens(&response.text) as u32);
            permit.correct(Some(u64::from(input_tokens)), Some(u64::from(output_tokens)));
            drop(permit);

            match (spec.validate)(&response.text) {
                Ok(parsed) => {
                    let record = InteractionRecord {
                        run_id: spec.run_id.clone(),
                        interaction_type: spec.kind,
                        batch_id: spec.batch_id,
                        attempt,
                        timestamp: chrono::Utc::now(),
                        prompt: current_prompt,
                        response_text: response.text.clone(),
                        response_parsed: parsed.clone(),
                        latency_ms,
                        input_tokens,
                        output_tokens,
                    };
                    self.store.record(&record, &key).await?;
                    self.emit(LlmEvent::Success {
                        run_id: spec.run_id.clone(),
                        kind: spec.kind,
                        batch_id: spec.batch_id,
                        attempt,
                        cached: false,
                        latency_ms,
                        input_tokens,
                        output_tokens,
                    });
                    return Ok(CallOutcome {
                        parsed,
                        raw_text: response.text,
                        cached: false,
                    });
                }
                Err(diag) => {
                    self.emit(LlmEvent::AttemptError {
                        run_id: spec.run_id.clone(),
                        kind: spec.kind,
                        batch_id: spec.batch_id,
                        attempt,
                        error_kind: AttemptErrorKind::Validation,
                        detail: diagnostic_summary(&diag),
                    });
                    if attempt == max_attempts {
                        self.emit(LlmEvent::Error {
                            run_id: spec.run_id.clone(),
                            kind: spec.kind,
                            batch_id: spec.batch_id,
                            attempts: attempt,
                            detail: diagnostic_summary(&diag),
                        });
                        return Err(Error::StageProtocol(format!(
                            "{} batch {} rejected by validator after {max_attempts} attempts: {}",
                            spec.kind,
                            spec.batch_id,
                            diagnostic_summary(&diag)
                        )));
                    }
                    current_prompt = (spec.build_retry_prompt)(&diag);
                }
            }
        }

        unreachable!("attempt loop returns on every path")
    }
}

fn diagnostic_summary(diag: &Diagnostic) -> String {
    format!(
        "structural={:?} missing={:?} extra={:?} duplicates={:?}",
        diag.structural, diag.missing_ids, diag.extra_ids, diag.duplicate_ids
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
