use ps_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic single-prompt completion request.
///
/// The pipeline sends each rendered prompt as one user message — no
/// conversation state is carried between calls.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Model identifier override. `None` uses the adapter's default.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Token usage reported by the provider, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A provider-agnostic completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Textual content of the response.
    pub text: String,
    /// Token usage, `None` when the provider does not report it.
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// The engine does not assume any particular provider; the default binding
/// targets a chat-completion HTTP API, and tests inject deterministic stubs.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one completion request and wait for the full response.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
