//! Deterministic even-sized batching with a seeded shuffle.
//!
//! Items are shuffled with a seeded PRNG so batches stay balanced when the
//! input has structure, then partitioned into `⌈N/B⌉` batches whose sizes
//! differ by at most one (remainder goes to the earliest batches). Pure and
//! reproducible: same input, same target size, same seed → same partition.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub const DEFAULT_SEED: u64 = 42;

/// Batch sizes for `total` items at `target` per batch: `⌈total/target⌉`
/// batches, remainder distributed to the earliest ones.
pub fn batch_sizes(total: usize, target: usize) -> Vec<usize> {
    if total == 0 || target == 0 {
        return Vec::new();
    }
    let num_batches = total.div_ceil(target);
    let base = total / num_batches;
    let remainder = total % num_batches;

    (0..num_batches)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Split `items` into evenly sized batches with deterministic ordering.
pub fn make_batches<T: Clone>(items: &[T], target: usize, seed: u64) -> Vec<Vec<T>> {
    if items.is_empty() || target == 0 {
        return Vec::new();
    }

    let mut shuffled: Vec<T> = items.to_vec();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let mut batches = Vec::new();
    let mut cursor = 0;
    for size in batch_sizes(items.len(), target) {
        batches.push(shuffled[cursor..cursor + size].to_vec());
        cursor += size;
    }
    batches
}
