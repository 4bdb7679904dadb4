//! LLM interaction records — the blob payload and its database index row.
//!
//! The blob is opaque to the database; the index row stores only the
//! pointer (`file_path`) plus the content hash used for cache lookups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interaction kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Extraction,
    Consolidation,
    Refinement,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Consolidation => "consolidation",
            Self::Refinement => "refinement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(Self::Extraction),
            "consolidation" => Some(Self::Consolidation),
            "refinement" => Some(Self::Refinement),
            _ => None,
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row per persisted LLM call (`product_segment_llm_interactions`).
/// Indexed on `cache_key` for O(1) replay lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionIndexEntry {
    pub id: i64,
    pub run_id: String,
    pub interaction_type: InteractionKind,
    /// Sequential within a stage, 1-based.
    pub batch_id: u32,
    pub attempt: u32,
    /// Opaque pointer into the blob store.
    pub file_path: String,
    /// 32-hex content hash of the rendered prompt plus canonicalized context.
    pub cache_key: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Blob payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The raw JSON record written to the blob store. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub run_id: String,
    pub interaction_type: InteractionKind,
    pub batch_id: u32,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    /// The full rendered prompt sent to the provider.
    pub prompt: String,
    /// Raw response text, exactly as the provider returned it.
    pub response_text: String,
    /// The structured payload that passed validation.
    pub response_parsed: serde_json::Value,
    pub latency_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_kind_parse_roundtrip() {
        for kind in [
            InteractionKind::Extraction,
            InteractionKind::Consolidation,
            InteractionKind::Refinement,
        ] {
            assert_eq!(InteractionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(InteractionKind::parse("chat"), None);
    }

    #[test]
    fn record_serde_roundtrip() {
        let rec = InteractionRecord {
            run_id: "RUN_X".into(),
            interaction_type: InteractionKind::Extraction,
            batch_id: 1,
            attempt: 1,
            timestamp: Utc::now(),
            prompt: "p".into(),
            response_text: "{}".into(),
            response_parsed: serde_json::json!({}),
            latency_ms: 12,
            input_tokens: 4,
            output_tokens: 2,
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: InteractionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
