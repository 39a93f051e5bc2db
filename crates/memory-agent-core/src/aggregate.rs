//! Result aggregation across the primary strategy and its fallbacks.
//!
//! # Algorithm
//!
//! 1. Walk results in order: the primary strategy first, then each fallback
//!    in the order it ran.
//! 2. Drop hits whose id is not in the candidate set, and hits with a
//!    non-finite score.
//! 3. The earliest result that mentions a document owns its score. Within
//!    that one result, duplicates keep their highest score.
//! 4. Sort by score (desc), then by first appearance.
//! 5. Truncate to `limit`.
//!
//! So when the primary scores a document 0.7 and a fallback scores it 0.9,
//! the merged score is 0.7.

use std::collections::HashMap;

use crate::models::{CandidateSet, RankedHit, StrategyResult};

struct Owned {
    score: f64,
    result_index: usize,
    first_seen: usize,
}

/// Merge, deduplicate, rank, and truncate strategy results.
pub fn aggregate(results: &[StrategyResult], candidates: &CandidateSet, limit: usize) -> Vec<RankedHit> {
    let mut owners: HashMap<&str, Owned> = HashMap::new();
    let mut seen = 0usize;

    for (result_index, result) in results.iter().enumerate() {
        for hit in &result.hits {
            if !hit.score.is_finite() || !candidates.contains(&hit.document_id) {
                continue;
            }
            match owners.get_mut(hit.document_id.as_str()) {
                Some(owned) if owned.result_index == result_index => {
                    owned.score = owned.score.max(hit.score);
                }
                Some(_) => {}
                None => {
                    owners.insert(
                        hit.document_id.as_str(),
                        Owned {
                            score: hit.score,
                            result_index,
                            first_seen: seen,
                        },
                    );
                    seen += 1;
                }
            }
        }
    }

    let mut ranked: Vec<(usize, RankedHit)> = owners
        .into_iter()
        .map(|(id, owned)| {
            let strategy = results[owned.result_index].strategy;
            (
                owned.first_seen,
                RankedHit {
                    document_id: id.to_string(),
                    score: owned.score,
                    strategy,
                },
            )
        })
        .collect();

    ranked.sort_by(|(a_seen, a), (b_seen, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_seen.cmp(b_seen))
    });
    ranked.truncate(limit);
    ranked.into_iter().map(|(_, hit)| hit).collect()
}
