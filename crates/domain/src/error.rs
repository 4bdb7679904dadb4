/// Shared error type used across all segmentation crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("database: {0}")]
    Db(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure after the per-call attempt budget is exhausted.
    #[error("LLM call failed: {0}")]
    LlmCall(String),

    /// The validator rejected a response that cannot be recovered by
    /// splitting (singleton batch, or a stage without split support).
    #[error("stage protocol violation: {0}")]
    StageProtocol(String),

    /// The per-run ceiling on total LLM calls was hit.
    #[error("LLM call budget exceeded: {0}")]
    CallBudgetExceeded(String),

    /// Blob checksum mismatch on a cache read.
    #[error("blob integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
