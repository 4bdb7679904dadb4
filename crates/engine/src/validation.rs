//! Response parsing and validation for the three LLM passes.
//!
//! Validators never panic and never return `ps_domain::Error` — a failed
//! validation produces a [`Diagnostic`] value that doubles as the context
//! for the retry prompt and as a test assertion target.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Diagnostic
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured account of why a response was rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    /// Shape problems: unparseable JSON, non-object root, malformed entries.
    pub structural: Vec<String>,
    pub missing_ids: Vec<String>,
    pub extra_ids: Vec<String>,
    pub duplicate_ids: Vec<String>,
    /// Leading slice of the offending response, for logs and retry context.
    pub response_excerpt: String,
}

impl Diagnostic {
    fn structural(message: impl Into<String>, response: &str) -> Self {
        Self {
            structural: vec![message.into()],
            response_excerpt: excerpt(response),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.structural.is_empty()
            && self.missing_ids.is_empty()
            && self.extra_ids.is_empty()
            && self.duplicate_ids.is_empty()
    }

    /// Render the diagnostic as the retry-prompt section appended between
    /// the base prompt and the re-sent input block.
    pub fn as_retry_section(&self) -> String {
        let mut out = String::from("\n\nPREVIOUS ATTEMPT FAILED:\n");
        if !self.structural.is_empty() {
            out.push_str("Validation errors:\n");
            for err in &self.structural {
                out.push_str("- ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.missing_ids.is_empty() {
            out.push_str(&format!("Missing IDs: {:?}\n", self.missing_ids));
        }
        if !self.extra_ids.is_empty() {
            out.push_str(&format!("Extra IDs: {:?}\n", self.extra_ids));
        }
        if !self.duplicate_ids.is_empty() {
            out.push_str(&format!("Duplicate IDs: {:?}\n", self.duplicate_ids));
        }
        out.push_str("\nPlease fix these issues and respond with valid JSON only.\n");
        out
    }
}

fn excerpt(response: &str) -> String {
    let mut end = response.len().min(500);
    while !response.is_char_boundary(end) {
        end -= 1;
    }
    response[..end].to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract the first top-level JSON object from free-form response text by
/// brace matching from the first `{`.
pub fn extract_json(text: &str) -> Result<&str, String> {
    let start = match text.find('{') {
        Some(i) => i,
        None => return Err("no JSON object found in response".into()),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (pos, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&text[start..start + pos + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Err("unterminated JSON object in response".into())
}

fn parse_object(text: &str) -> Result<serde_json::Map<String, Value>, Diagnostic> {
    let snippet = extract_json(text).map_err(|e| Diagnostic::structural(e, text))?;
    let value: Value = serde_json::from_str(snippet)
        .map_err(|e| Diagnostic::structural(format!("could not parse JSON: {e}"), text))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Diagnostic::structural(
            "response root must be a JSON object",
            text,
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One proposed segment: a definition plus the positional indices of the
/// batch products assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub definition: String,
    pub ids: Vec<usize>,
}

/// Segment name → entry, sorted by name for stable downstream iteration.
pub type ExtractionMap = BTreeMap<String, SegmentEntry>;

/// Validate an extraction response against a batch of `batch_len` products.
///
/// Completeness is required: every positional index `0..batch_len` must
/// appear exactly once across all segments.
pub fn validate_extraction(text: &str, batch_len: usize) -> Result<ExtractionMap, Diagnostic> {
    let object = parse_object(text)?;

    let mut result = ExtractionMap::new();
    let mut diag = Diagnostic {
        response_excerpt: excerpt(text),
        ..Default::default()
    };
    let mut found: BTreeSet<usize> = BTreeSet::new();

    for (name, entry) in &object {
        let entry_obj = match entry.as_object() {
            Some(o) => o,
            None => {
                diag.structural
                    .push(format!("segment '{name}' must be an object"));
                continue;
            }
        };

        let definition = match entry_obj.get("definition").and_then(Value::as_str) {
            Some(d) => d.to_string(),
            None => {
                diag.structural
                    .push(format!("segment '{name}' missing string 'definition'"));
                String::new()
            }
        };

        let ids_value = match entry_obj.get("ids").and_then(Value::as_array) {
            Some(a) => a,
            None => {
                diag.structural
                    .push(format!("segment '{name}' missing 'ids' array"));
                continue;
            }
        };

        let mut ids = Vec::with_capacity(ids_value.len());
        for id in ids_value {
            match id.as_u64() {
                Some(n) => {
                    let n = n as usize;
                    if !found.insert(n) {
                        diag.duplicate_ids.push(n.to_string());
                    }
                    ids.push(n);
                }
                None => diag
                    .structural
                    .push(format!("segment '{name}' id '{id}' must be an integer")),
            }
        }

        result.insert(name.clone(), SegmentEntry { definition, ids });
    }

    for expected in 0..batch_len {
        if !found.contains(&expected) {
            diag.missing_ids.push(expected.to_string());
        }
    }
    for got in &found {
        if *got >= batch_len {
            diag.extra_ids.push(got.to_string());
        }
    }

    if diag.is_clean() {
        Ok(result)
    } else {
        Err(diag)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consolidation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One merged category: definition plus the synthetic `A_i`/`B_j` ids of
/// the source categories folded into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEntry {
    pub definition: String,
    pub ids: Vec<String>,
}

pub type ConsolidationMap = BTreeMap<String, MergedEntry>;

/// Validate a consolidation response. Every synthetic id in `expected`
/// must appear exactly once across the merged output; no unknown ids.
pub fn validate_consolidation(
    text: &str,
    expected: &BTreeSet<String>,
) -> Result<ConsolidationMap, Diagnostic> {
    let object = parse_object(text)?;

    let mut result = ConsolidationMap::new();
    let mut diag = Diagnostic {
        response_excerpt: excerpt(text),
        ..Default::default()
    };
    let mut found: BTreeSet<String> = BTreeSet::new();

    for (name, entry) in &object {
        let entry_obj = match entry.as_object() {
            Some(o) => o,
            None => {
                diag.structural
                    .push(format!("category '{name}' must be an object"));
                continue;
            }
        };

        let definition = match entry_obj.get("definition").and_then(Value::as_str) {
            Some(d) => d.to_string(),
            None => {
                diag.structural
                    .push(format!("category '{name}' missing string 'definition'"));
                String::new()
            }
        };

        let ids_value = match entry_obj.get("ids").and_then(Value::as_array) {
            Some(a) => a,
            None => {
                diag.structural
                    .push(format!("category '{name}' missing 'ids' array"));
                continue;
            }
        };

        let mut ids = Vec::with_capacity(ids_value.len());
        for id in ids_value {
            let id = match id.as_str() {
                Some(s) => s,
                None => {
                    diag.structural
                        .push(format!("category '{name}' id '{id}' must be a string"));
                    continue;
                }
            };
            if !id.starts_with("A_") && !id.starts_with("B_") {
                diag.structural
                    .push(format!("id '{id}' must start with A_ or B_"));
                continue;
            }
            if !expected.contains(id) {
                diag.extra_ids.push(id.to_string());
            } else if !found.insert(id.to_string()) {
                diag.duplicate_ids.push(id.to_string());
            }
            ids.push(id.to_string());
        }

        result.insert(name.clone(), MergedEntry { definition, ids });
    }

    for want in expected {
        if !found.contains(want) {
            diag.missing_ids.push(want.clone());
        }
    }

    if diag.is_clean() {
        Ok(result)
    } else {
        Err(diag)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Refinement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `P_i → S_j` reassignments. An empty map is valid and means "no changes
/// in this batch"; missing `P_i` keys mean "keep current".
pub type RefinementMap = BTreeMap<String, String>;

pub fn validate_refinement(
    text: &str,
    batch_products: &BTreeSet<String>,
    known_segments: &BTreeSet<String>,
) -> Result<RefinementMap, Diagnostic> {
    let object = parse_object(text)?;

    let mut result = RefinementMap::new();
    let mut diag = Diagnostic {
        response_excerpt: excerpt(text),
        ..Default::default()
    };

    for (product, segment) in &object {
        let segment = match segment.as_str() {
            Some(s) => s,
            None => {
                diag.structural
                    .push(format!("value for '{product}' must be a segment id string"));
                continue;
            }
        };
        if !batch_products.contains(product) {
            diag.extra_ids.push(product.clone());
        }
        if !known_segments.contains(segment) {
            diag.structural
                .push(format!("unknown segment id '{segment}' for '{product}'"));
        }
        result.insert(product.clone(), segment.to_string());
    }

    if diag.is_clean() {
        Ok(result)
    } else {
        Err(diag)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // ── extract_json ────────────────────────────────────────────────

    #[test]
    fn extract_json_plain_object() {
        assert_eq!(extract_json(r#"{"a":1}"#).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn extract_json_with_surrounding_prose() {
        let text = "Sure! Here is the result:\n{\"a\": {\"b\": 2}}\nHope that helps.";
        assert_eq!(extract_json(text).unwrap(), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn extract_json_ignores_braces_inside_strings() {
        let text = r#"{"name": "curly } brace", "n": 1}"#;
        assert_eq!(extract_json(text).unwrap(), text);
    }

    #[test]
    fn extract_json_no_object() {
        assert!(extract_json("no json here").is_err());
    }

    #[test]
    fn extract_json_unterminated() {
        assert!(extract_json(r#"{"a": {"b": 1}"#).is_err());
    }

    // ── extraction ──────────────────────────────────────────────────

    #[test]
    fn extraction_happy_path() {
        let text = r#"{"Smart":{"definition":"WiFi-enabled","ids":[0,1]},"Manual":{"definition":"Mechanical","ids":[2]}}"#;
        let map = validate_extraction(text, 3).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["Smart"].ids, vec![0, 1]);
        assert_eq!(map["Manual"].definition, "Mechanical");
    }

    #[test]
    fn extraction_missing_id_reported() {
        let text = r#"{"Smart":{"definition":"d","ids":[0,1]}}"#;
        let diag = validate_extraction(text, 3).unwrap_err();
        assert_eq!(diag.missing_ids, vec!["2"]);
        assert!(diag.structural.is_empty());
    }

    #[test]
    fn extraction_extra_and_duplicate_ids_reported() {
        let text = r#"{"A":{"definition":"d","ids":[0,1,1]},"B":{"definition":"d","ids":[5]}}"#;
        let diag = validate_extraction(text, 2).unwrap_err();
        assert_eq!(diag.duplicate_ids, vec!["1"]);
        assert_eq!(diag.extra_ids, vec!["5"]);
    }

    #[test]
    fn extraction_non_object_entry_is_structural() {
        let text = r#"{"A": [1,2]}"#;
        let diag = validate_extraction(text, 2).unwrap_err();
        assert!(diag.structural[0].contains("must be an object"));
    }

    #[test]
    fn extraction_malformed_json_is_structural() {
        let diag = validate_extraction("not json at all", 1).unwrap_err();
        assert!(!diag.structural.is_empty());
    }

    #[test]
    fn extraction_singleton_batch() {
        let text = r#"{"Only":{"definition":"d","ids":[0]}}"#;
        let map = validate_extraction(text, 1).unwrap();
        assert_eq!(map["Only"].ids, vec![0]);
    }

    // ── consolidation ───────────────────────────────────────────────

    #[test]
    fn consolidation_happy_path() {
        let expected = set(&["A_0", "A_1", "B_0", "B_1"]);
        let text = r#"{"Smart Switch":{"definition":"d","ids":["A_0","B_0"]},"Mechanical":{"definition":"d","ids":["A_1","B_1"]}}"#;
        let map = validate_consolidation(text, &expected).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["Smart Switch"].ids, vec!["A_0", "B_0"]);
    }

    #[test]
    fn consolidation_missing_synthetic_id() {
        let expected = set(&["A_0", "B_0"]);
        let text = r#"{"X":{"definition":"d","ids":["A_0"]}}"#;
        let diag = validate_consolidation(text, &expected).unwrap_err();
        assert_eq!(diag.missing_ids, vec!["B_0"]);
    }

    #[test]
    fn consolidation_unknown_and_duplicate_ids() {
        let expected = set(&["A_0", "B_0"]);
        let text = r#"{"X":{"definition":"d","ids":["A_0","A_0","B_0","B_7"]}}"#;
        let diag = validate_consolidation(text, &expected).unwrap_err();
        assert_eq!(diag.duplicate_ids, vec!["A_0"]);
        assert_eq!(diag.extra_ids, vec!["B_7"]);
    }

    #[test]
    fn consolidation_rejects_bad_prefix() {
        let expected = set(&["A_0"]);
        let text = r#"{"X":{"definition":"d","ids":["C_0","A_0"]}}"#;
        let diag = validate_consolidation(text, &expected).unwrap_err();
        assert!(diag.structural[0].contains("A_ or B_"));
    }

    // ── refinement ──────────────────────────────────────────────────

    #[test]
    fn refinement_empty_object_is_valid() {
        let products = set(&["P_0", "P_1"]);
        let segments = set(&["S_0", "S_1"]);
        let map = validate_refinement("{}", &products, &segments).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn refinement_partial_mapping_is_valid() {
        let products = set(&["P_0", "P_1", "P_2"]);
        let segments = set(&["S_0", "S_1"]);
        let map = validate_refinement(r#"{"P_1":"S_0"}"#, &products, &segments).unwrap();
        assert_eq!(map["P_1"], "S_0");
    }

    #[test]
    fn refinement_unknown_product_rejected() {
        let products = set(&["P_0"]);
        let segments = set(&["S_0"]);
        let diag = validate_refinement(r#"{"P_9":"S_0"}"#, &products, &segments).unwrap_err();
        assert_eq!(diag.extra_ids, vec!["P_9"]);
    }

    #[test]
    fn refinement_unknown_segment_rejected() {
        let products = set(&["P_0"]);
        let segments = set(&["S_0"]);
        let diag = validate_refinement(r#"{"P_0":"S_9"}"#, &products, &segments).unwrap_err();
        assert!(diag.structural[0].contains("S_9"));
    }

    // ── diagnostic rendering ────────────────────────────────────────

    #[test]
    fn retry_section_mentions_each_problem_class() {
        let diag = Diagnostic {
            structural: vec!["segment 'X' missing 'ids' array".into()],
            missing_ids: vec!["2".into()],
            extra_ids: vec!["9".into()],
            duplicate_ids: vec!["1".into()],
            response_excerpt: String::new(),
        };
        let section = diag.as_retry_section();
        assert!(section.contains("PREVIOUS ATTEMPT FAILED"));
        assert!(section.contains("Missing IDs"));
        assert!(section.contains("Extra IDs"));
        assert!(section.contains("Duplicate IDs"));
        assert!(section.contains("missing 'ids' array"));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let text = format!("{}é", "x".repeat(499));
        let diag = Diagnostic::structural("err", &text);
        assert!(diag.response_excerpt.len() <= 500);
    }
}
