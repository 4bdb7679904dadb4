use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP server settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "d_bind_addr")]
    pub bind_addr: String,
    /// SSE poll cadence against the run record, milliseconds.
    #[serde(default = "d_poll_ms")]
    pub progress_poll_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: d_bind_addr(),
            progress_poll_ms: d_poll_ms(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_bind_addr() -> String {
    "127.0.0.1:8080".into()
}
fn d_poll_ms() -> u64 {
    500
}
