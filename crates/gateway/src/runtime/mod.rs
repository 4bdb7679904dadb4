//! Runtime components: cancellation, rate limiting, the LLM call gateway,
//! the stage engine, and the orchestrator service.

pub mod cancel;
pub mod limiter;
pub mod llm;
pub mod orchestrator;
pub mod stages;
