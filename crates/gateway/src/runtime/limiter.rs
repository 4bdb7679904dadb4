//! Token-aware rate limiter for LLM calls.
//!
//! One instance per process, constructed at startup and shared by every
//! run. Admission reserves the estimated input tokens, half the model's
//! max tokens as the output estimate, and one request slot across three
//! 60-second sliding windows; the concurrency gate is a semaphore acquired
//! before the windows are checked and held for the entire call. After the
//! call, reservations are corrected to the usage the provider reported.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use ps_domain::config::LimitSettings;
use ps_domain::error::{Error, Result};

use super::cancel::CancelToken;

const WINDOW: Duration = Duration::from_secs(60);
const ADMISSION_POLL: Duration = Duration::from_millis(250);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sliding windows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Usage trackers; every entry is `(timestamp, amount)`.
struct Windows {
    requests: VecDeque<(Instant, u64)>,
    input_tokens: VecDeque<(Instant, u64)>,
    output_tokens: VecDeque<(Instant, u64)>,
}

impl Windows {
    fn purge(&mut self, now: Instant) {
        for dq in [
            &mut self.requests,
            &mut self.input_tokens,
            &mut self.output_tokens,
        ] {
            while dq
                .front()
                .is_some_and(|(ts, _)| now.duration_since(*ts) > WINDOW)
            {
                dq.pop_front();
            }
        }
    }
}

fn fits(dq: &VecDeque<(Instant, u64)>, limit: u64, add: u64) -> bool {
    dq.iter().map(|(_, v)| v).sum::<u64>() + add <= limit
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RateLimiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RateLimiter {
    max_rpm: u64,
    max_input_tokens: u64,
    max_output_tokens: u64,
    /// Output reservation when no better estimate exists: half of this.
    model_max_tokens: u32,
    windows: Mutex<Windows>,
    semaphore: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(limits: &LimitSettings, model_max_tokens: u32) -> Self {
        Self {
            max_rpm: u64::from(limits.max_requests_per_minute),
            max_input_tokens: limits.max_input_tokens_per_minute,
            max_output_tokens: limits.max_output_tokens_per_minute,
            model_max_tokens,
            windows: Mutex::new(Windows {
                requests: VecDeque::new(),
                input_tokens: VecDeque::new(),
                output_tokens: VecDeque::new(),
            }),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent_requests)),
        }
    }

    /// Block until the request fits all three windows, or the caller is
    /// cancelled. The returned permit holds the concurrency slot for the
    /// whole call; dropping it releases the slot unconditionally.
    pub async fn acquire(
        self: &Arc<Self>,
        est_input_tokens: u64,
        cancel: &CancelToken,
    ) -> Result<RatePermit> {
        let est_output_tokens = u64::from(self.model_max_tokens / 2);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("rate limiter semaphore closed".into()))?;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("while awaiting rate-limit admission".into()));
            }

            {
                let now = Instant::now();
                let mut windows = self.windows.lock();
                windows.purge(now);

                if fits(&windows.requests, self.max_rpm, 1)
                    && fits(&windows.input_tokens, self.max_input_tokens, est_input_tokens)
                    && fits(
                        &windows.output_tokens,
                        self.max_output_tokens,
                        est_output_tokens,
                    )
                {
                    windows.requests.push_back((now, 1));
                    windows.input_tokens.push_back((now, est_input_tokens));
                    windows.output_tokens.push_back((now, est_output_tokens));
                    return Ok(RatePermit {
                        limiter: Arc::clone(self),
                        _permit: permit,
                    });
                }
            }

            tokio::time::sleep(ADMISSION_POLL).await;
        }
    }

    /// Best-effort correction: rewrite the newest window entries in place
    /// with the usage the provider actually reported.
    fn correct(&self, actual_input: Option<u64>, actual_output: Option<u64>) {
        let mut windows = self.windows.lock();
        if let Some(tokens) = actual_input {
            if let Some(entry) = windows.input_tokens.back_mut() {
                entry.1 = tokens;
            }
        }
        if let Some(tokens) = actual_output {
            if let Some(entry) = windows.output_tokens.back_mut() {
                entry.1 = tokens;
            }
        }
    }

    /// Current 60-second sums, for tests and diagnostics.
    pub fn window_sums(&self) -> (u64, u64, u64) {
        let mut windows = self.windows.lock();
        windows.purge(Instant::now());
        (
            windows.requests.iter().map(|(_, v)| v).sum(),
            windows.input_tokens.iter().map(|(_, v)| v).sum(),
            windows.output_tokens.iter().map(|(_, v)| v).sum(),
        )
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Admission handle. Dropping it frees the concurrency slot; the token
/// reservations stay as best-estimate unless corrected.
pub struct RatePermit {
    limiter: Arc<RateLimiter>,
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    /// Correct the reservations to actual usage after a successful call.
    pub fn correct(&self, actual_input: Option<u64>, actual_output: Option<u64>) {
        self.limiter.correct(actual_input, actual_output);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rpm: u32, input: u64, output: u64, concurrent: usize) -> LimitSettings {
        LimitSettings {
            max_requests_per_minute: rpm,
            max_input_tokens_per_minute: input,
            max_output_tokens_per_minute: output,
            max_concurrent_requests: concurrent,
            max_llm_calls_per_execute: 500,
        }
    }

    #[tokio::test]
    async fn admission_reserves_all_three_windows() {
        let limiter = Arc::new(RateLimiter::new(&limits(10, 1000, 1000, 4), 100));
        let cancel = CancelToken::new();

        let permit = limiter.acquire(40, &cancel).await.unwrap();
        let (reqs, input, output) = limiter.window_sums();
        assert_eq!(reqs, 1);
        assert_eq!(input, 40);
        assert_eq!(output, 50); // model_max_tokens / 2
        drop(permit);
    }

    #[tokio::test]
    async fn correction_rewrites_reservations() {
        let limiter = Arc::new(RateLimiter::new(&limits(10, 1000, 1000, 4), 100));
        let cancel = CancelToken::new();

        let permit = limiter.acquire(40, &cancel).await.unwrap();
        permit.correct(Some(12), Some(7));
        let (_, input, output) = limiter.window_sums();
        assert_eq!(input, 12);
        assert_eq!(output, 7);
    }

    #[tokio::test]
    async fn concurrency_slot_released_on_drop() {
        let limiter = Arc::new(RateLimiter::new(&limits(100, 100_000, 100_000, 2), 100));
        let cancel = CancelToken::new();

        let a = limiter.acquire(1, &cancel).await.unwrap();
        let _b = limiter.acquire(1, &cancel).await.unwrap();
        assert_eq!(limiter.available_slots(), 0);

        drop(a);
        assert_eq!(limiter.available_slots(), 1);
    }

    #[tokio::test]
    async fn window_never_exceeds_request_cap() {
        let limiter = Arc::new(RateLimiter::new(&limits(3, 100_000, 100_000, 10), 100));
        let cancel = CancelToken::new();

        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(limiter.acquire(1, &cancel).await.unwrap());
        }
        let (reqs, _, _) = limiter.window_sums();
        assert_eq!(reqs, 3);

        // A fourth admission would push the window over the cap, so it
        // must still be pending after a generous wait.
        let blocked = tokio::time::timeout(
            Duration::from_millis(600),
            limiter.acquire(1, &cancel),
        )
        .await;
        assert!(blocked.is_err(), "fourth call must block on the rpm window");
        let (reqs, _, _) = limiter.window_sums();
        assert_eq!(reqs, 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_admission_wait() {
        let limiter = Arc::new(RateLimiter::new(&limits(1, 100_000, 100_000, 10), 100));
        let cancel = CancelToken::new();

        let _held = limiter.acquire(1, &cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(1, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn token_budget_blocks_oversized_second_call() {
        let limiter = Arc::new(RateLimiter::new(&limits(100, 100, 100_000, 10), 4));
        let cancel = CancelToken::new();

        let _first = limiter.acquire(80, &cancel).await.unwrap();
        // 80 + 30 > 100 input tokens → must block.
        let blocked = tokio::time::timeout(
            Duration::from_millis(600),
            limiter.acquire(30, &cancel),
        )
        .await;
        assert!(blocked.is_err());
    }
}
