//! Prompt template loading and rendering.
//!
//! Three templates are loaded once at startup; a missing file fails the
//! boot. Templates carry only the well-known `{product_category}`,
//! `{taxonomy_a}` and `{taxonomy_b}` placeholders — rendering is plain
//! string substitution, no template engine.

use std::collections::BTreeMap;
use std::path::Path;

use ps_domain::error::{Error, Result};
use ps_domain::taxonomy::{TaxonomyDraft, TaxonomyRecord};

pub const EXTRACTION_TEMPLATE: &str = "extract_taxonomy.txt";
pub const CONSOLIDATION_TEMPLATE: &str = "consolidate_taxonomy.txt";
pub const REFINEMENT_TEMPLATE: &str = "refine_assignments.txt";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The three prompt templates, loaded at startup.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub extraction: String,
    pub consolidation: String,
    pub refinement: String,
}

impl PromptSet {
    /// Load all three templates from `dir`. Fails fast on the first
    /// missing or unreadable file.
    pub fn load(dir: &Path) -> Result<Self> {
        let set = Self {
            extraction: read_template(dir, EXTRACTION_TEMPLATE)?,
            consolidation: read_template(dir, CONSOLIDATION_TEMPLATE)?,
            refinement: read_template(dir, REFINEMENT_TEMPLATE)?,
        };
        tracing::debug!(dir = %dir.display(), "prompt templates loaded");
        Ok(set)
    }
}

fn read_template(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!(
            "prompt template '{}' could not be read: {e}",
            path.display()
        ))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The positional-index block for one extraction batch:
/// `[0] title` per line, index order matching the batch ordering.
pub fn extraction_input_block(titles: &[String]) -> String {
    titles
        .iter()
        .enumerate()
        .map(|(i, t)| format!("[{i}] {t}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full first-attempt extraction prompt: template with the category
/// substituted, then the product block.
pub fn render_extraction(template: &str, category: &str, titles: &[String]) -> String {
    let base = template.replace("{product_category}", category);
    format!("{base}\n\n{}", extraction_input_block(titles))
}

/// Retry variant: base prompt + diagnostic section + the same input block.
pub fn render_extraction_retry(
    template: &str,
    category: &str,
    titles: &[String],
    retry_section: &str,
) -> String {
    let base = template.replace("{product_category}", category);
    format!(
        "{base}{retry_section}\n{}",
        extraction_input_block(titles)
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consolidation rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Synthetic ids for one consolidation half: `A_0..A_{n-1}` or `B_*`.
pub fn synthetic_ids(prefix: char, len: usize) -> Vec<String> {
    (0..len).map(|i| format!("{prefix}_{i}")).collect()
}

/// Rewrite one half as `{name: {definition, ids: ["A_i"]}}` preserving
/// provenance via the synthetic ids.
pub fn consolidation_half(drafts: &[TaxonomyDraft], prefix: char) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (i, draft) in drafts.iter().enumerate() {
        map.insert(
            draft.segment_name.clone(),
            serde_json::json!({
                "definition": draft.definition,
                "ids": [format!("{prefix}_{i}")],
            }),
        );
    }
    serde_json::Value::Object(map)
}

/// Full consolidation prompt for two halves.
pub fn render_consolidation(template: &str, half_a: &[TaxonomyDraft], half_b: &[TaxonomyDraft]) -> String {
    let a = serde_json::to_string_pretty(&consolidation_half(half_a, 'A'))
        .unwrap_or_else(|_| "{}".into());
    let b = serde_json::to_string_pretty(&consolidation_half(half_b, 'B'))
        .unwrap_or_else(|_| "{}".into());
    template.replace("{taxonomy_a}", &a).replace("{taxonomy_b}", &b)
}

pub fn render_consolidation_retry(
    template: &str,
    half_a: &[TaxonomyDraft],
    half_b: &[TaxonomyDraft],
    retry_section: &str,
) -> String {
    format!(
        "{}{retry_section}",
        render_consolidation(template, half_a, half_b)
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Refinement rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A product slated for refinement, already joined with its current
/// consolidated taxonomy.
#[derive(Debug, Clone)]
pub struct RefinementProduct {
    pub product_id: i64,
    pub title: String,
    pub current_taxonomy_id: i64,
}

/// The numbered `S_i` view of the consolidated taxonomy, shared by every
/// refinement batch of a run.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    /// Rendered `**SUBCATEGORIES:**` section.
    pub section: String,
    /// `S_i` → taxonomy surrogate id.
    pub id_by_label: BTreeMap<String, i64>,
    /// taxonomy surrogate id → (`S_i`, segment name).
    pub label_by_id: BTreeMap<i64, (String, String)>,
}

impl SegmentIndex {
    /// Number the consolidated taxonomies `S_0..S_{k-1}` in the order given.
    pub fn build(consolidated: &[TaxonomyRecord]) -> Self {
        let mut id_by_label = BTreeMap::new();
        let mut label_by_id = BTreeMap::new();
        let mut lines = vec!["**SUBCATEGORIES:**".to_string()];

        for (i, tax) in consolidated.iter().enumerate() {
            let label = format!("S_{i}");
            lines.push(format!("[{label}] {}: {}", tax.segment_name, tax.definition));
            id_by_label.insert(label.clone(), tax.id);
            label_by_id.insert(tax.id, (label, tax.segment_name.clone()));
        }

        Self {
            section: lines.join("\n") + "\n",
            id_by_label,
            label_by_id,
        }
    }
}

/// Render the per-batch `**PRODUCTS WITH CURRENT ASSIGNMENTS:**` section.
/// Returns the section plus the `P_i` → product id mapping.
pub fn products_section(
    products: &[RefinementProduct],
    index: &SegmentIndex,
) -> (String, BTreeMap<String, i64>) {
    let mut lines = vec!["\n**PRODUCTS WITH CURRENT ASSIGNMENTS:**".to_string()];
    let mut by_label = BTreeMap::new();

    for (i, product) in products.iter().enumerate() {
        let p_label = format!("P_{i}");
        let (s_label, name) = index
            .label_by_id
            .get(&product.current_taxonomy_id)
            .cloned()
            .unwrap_or_else(|| ("S_?".to_string(), "unknown".to_string()));
        lines.push(format!(
            "[{p_label}] {} → {s_label} ({name})",
            product.title
        ));
        by_label.insert(p_label, product.product_id);
    }

    (lines.join("\n") + "\n", by_label)
}

/// Full first-attempt refinement prompt for one batch.
pub fn render_refinement(template: &str, index: &SegmentIndex, products_block: &str) -> String {
    format!("{template}\n\n{}{products_block}", index.section)
}

pub fn render_refinement_retry(
    template: &str,
    index: &SegmentIndex,
    products_block: &str,
    retry_section: &str,
) -> String {
    format!(
        "{template}{retry_section}\n{}{products_block}",
        index.section
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
