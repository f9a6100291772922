//! Nearest-identity search over an enrollment snapshot.

use crate::types::{EnrollmentRecord, FaceDescriptor, IdentityKey, MatchResult};

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// Distances closer than this to the minimum count as a tie.
pub const DEFAULT_TIE_EPSILON: f32 = 1e-6;

/// Strategy for resolving a query descriptor against enrolled records.
///
/// Implementations must only read the snapshot. The result must not depend
/// on the order of records in the snapshot.
pub trait Matcher: Send + Sync {
    fn resolve(&self, query: &FaceDescriptor, snapshot: &[EnrollmentRecord]) -> MatchResult;
}

/// Exhaustive Euclidean matcher.
///
/// Scans every record (O(n·d)), keeps the true minimum and reports ties at
/// that minimum as [`MatchResult::Ambiguous`] instead of picking one.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
    pub tie_epsilon: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            tie_epsilon: DEFAULT_TIE_EPSILON,
        }
    }

    /// Set the tie tolerance. Must be finite and non-negative; anything
    /// else falls back to [`DEFAULT_TIE_EPSILON`].
    pub fn with_tie_epsilon(mut self, tie_epsilon: f32) -> Self {
        self.tie_epsilon = tie_epsilon;
        self
    }

    fn effective_tie_epsilon(&self) -> f32 {
        if self.tie_epsilon.is_finite() && self.tie_epsilon >= 0.0 {
            self.tie_epsilon
        } else {
            tracing::warn!(
                tie_epsilon = self.tie_epsilon,
                "invalid tie epsilon, using default"
            );
            DEFAULT_TIE_EPSILON
        }
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DISTANCE_THRESHOLD)
    }
}

impl Matcher for EuclideanMatcher {
    fn resolve(&self, query: &FaceDescriptor, snapshot: &[EnrollmentRecord]) -> MatchResult {
        let mut scored: Vec<(f32, &IdentityKey)> = Vec::with_capacity(snapshot.len());
        let mut best = f32::INFINITY;
        let mut skipped = 0usize;

        // No early exit: every record is compared.
        for record in snapshot {
            match query.distance(&record.descriptor) {
                Some(dist) => {
                    if dist < best {
                        best = dist;
                    }
                    scored.push((dist, &record.identity_key));
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                query_dim = query.dimension(),
                "skipped enrollment records with mismatched descriptor dimension"
            );
        }
        tracing::debug!(compared = scored.len(), best, "scan complete");

        if scored.is_empty() {
            return MatchResult::NoMatch {
                nearest_distance: None,
            };
        }

        if best > self.threshold {
            return MatchResult::NoMatch {
                nearest_distance: Some(best),
            };
        }

        let tie_epsilon = self.effective_tie_epsilon();
        let mut tied: Vec<IdentityKey> = scored
            .into_iter()
            .filter(|(dist, _)| *dist - best <= tie_epsilon)
            .map(|(_, key)| key.clone())
            .collect();
        tied.sort();
        tied.dedup();

        if tied.len() == 1 {
            MatchResult::Matched {
                identity_key: tied.remove(0),
                distance: best,
            }
        } else {
            MatchResult::Ambiguous {
                candidates: tied,
                distance: best,
            }
        }
    }
}
