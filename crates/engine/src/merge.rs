//! Name-based taxonomy aggregation.
//!
//! Used when the halves of a split batch are folded back together, and to
//! translate a validated consolidation response into drafts. Merge policy:
//! first non-empty definition wins, product counts are summed.

use std::collections::BTreeMap;

use ps_domain::taxonomy::TaxonomyDraft;

use crate::validation::ConsolidationMap;

/// Fold duplicate segment names together, preserving first-seen order.
pub fn merge_drafts(drafts: &[TaxonomyDraft]) -> Vec<TaxonomyDraft> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: BTreeMap<String, TaxonomyDraft> = BTreeMap::new();

    for draft in drafts {
        match merged.get_mut(&draft.segment_name) {
            Some(existing) => {
                if existing.definition.is_empty() && !draft.definition.is_empty() {
                    existing.definition = draft.definition.clone();
                }
                existing.product_count += draft.product_count;
            }
            None => {
                order.push(draft.segment_name.clone());
                merged.insert(draft.segment_name.clone(), draft.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|name| merged.remove(&name))
        .collect()
}

/// Translate a validated consolidation response back into drafts, summing
/// product counts of the source categories referenced by each merged entry.
pub fn apply_consolidation(
    half_a: &[TaxonomyDraft],
    half_b: &[TaxonomyDraft],
    merged: &ConsolidationMap,
) -> Vec<TaxonomyDraft> {
    let source = |id: &str| -> Option<&TaxonomyDraft> {
        let (prefix, idx) = id.split_once('_')?;
        let idx: usize = idx.parse().ok()?;
        match prefix {
            "A" => half_a.get(idx),
            "B" => half_b.get(idx),
            _ => None,
        }
    };

    merged
        .iter()
        .map(|(name, entry)| {
            let product_count = entry
                .ids
                .iter()
                .filter_map(|id| source(id))
                .map(|d| d.product_count)
                .sum();
            TaxonomyDraft {
                segment_name: name.clone(),
                definition: entry.definition.clone(),
                product_count,
            }
        })
        .collect()
}
