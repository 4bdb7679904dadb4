//! Shared domain types for the product segmentation engine.
//!
//! Everything here is plain data: run records and the stage state machine,
//! taxonomies and assignments, LLM interaction records, configuration, and
//! the crate-wide error type. Behavior lives in the sibling crates.

pub mod config;
pub mod error;
pub mod interaction;
pub mod run;
pub mod taxonomy;

pub use error::{Error, Result};
