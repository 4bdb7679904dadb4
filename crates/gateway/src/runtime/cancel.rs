//! Per-run cancellation tokens.
//!
//! Each executing run gets a `CancelToken`. Calling `cancel()` signals the
//! stage engine to stop cleanly: in-flight LLM calls are abandoned, no
//! further batches start, and the run transitions to `failed` with a
//! cancellation reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation token checked at every suspension point in the pipeline.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks active cancellation tokens per run id.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new cancel token for a run.
    pub fn register(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Cancel an executing run. Returns true if a token was found.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token for a run (called when execution finishes).
    pub fn remove(&self, run_id: &str) {
        self.tokens.lock().remove(run_id);
    }

    /// Check if a run is currently executing.
    pub fn is_running(&self, run_id: &str) -> bool {
        self.tokens.lock().contains_key(run_id)
    }
}
