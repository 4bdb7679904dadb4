//! LLM provider adapters for the segmentation pipeline.
//!
//! The [`traits::LlmProvider`] trait is the seam the gateway calls through;
//! [`openai_compat::OpenAiCompatProvider`] is the default HTTP binding.

pub mod openai_compat;
pub mod tokens;
pub mod traits;

mod util;

pub use openai_compat::OpenAiCompatProvider;
pub use traits::{CompletionRequest, CompletionResponse, LlmProvider, Usage};
