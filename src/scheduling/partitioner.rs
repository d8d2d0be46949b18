//! # Keyword Partitioner
//!
//! Splits the deduplicated keyword set into contiguous, balanced groups.
//! Groups are cut from the set's sorted order, so repeated calls with the same
//! input produce the same groups.

use crate::domain::{KeywordGroup, KeywordSet};

/// Splits `keywords` into at most `worker_count` groups.
///
/// - More keywords than workers: groups of `⌈|K| / W⌉` keywords, the last one
///   possibly shorter. Short groups are never padded.
/// - Otherwise: one singleton group per keyword.
/// - No keywords: no groups.
///
/// A `worker_count` of zero is treated as one worker.
#[must_use]
pub fn partition(keywords: &KeywordSet, worker_count: usize) -> Vec<KeywordGroup> {
    let worker_count = worker_count.max(1);
    let ordered: Vec<_> = keywords.iter().cloned().collect();

    if ordered.is_empty() {
        return Vec::new();
    }

    let chunk_size = if ordered.len() > worker_count {
        ordered.len().div_ceil(worker_count)
    } else {
        1
    };

    ordered
        .chunks(chunk_size)
        .map(|chunk| KeywordGroup::new(chunk.to_vec()))
        .collect()
}
