use thiserror::Error;
use uuid::Uuid;

/// Similarity above which two descriptors are treated as the same person.
/// Fixed policy, not configurable at runtime.
pub const MATCH_THRESHOLD: f32 = 0.85;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("descriptor length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("non-finite descriptor value at index {index}")]
    NonFinite { index: usize },
}

/// Cosine similarity of two equal-length vectors, clamped to `[0, 1]`.
///
/// A zero-norm input yields `0.0`. Negative correlation is floored at zero;
/// face descriptors are never meaningfully anti-correlated.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (index, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
        if !x.is_finite() || !y.is_finite() {
            return Err(SimilarityError::NonFinite { index });
        }
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(similarity.clamp(0.0, 1.0) as f32)
}

/// Outcome of comparing one query descriptor against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Highest similarity seen across the gallery (0.0 for an empty gallery).
    pub similarity: f32,
    /// Identity of the best candidate. Only set when `matched` is true.
    pub user_id: Option<Uuid>,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            user_id: None,
        }
    }
}

pub trait Matcher {
    /// Compare `query` against every gallery entry and report the arg-max.
    fn compare<'a, I>(&self, query: &[f32], gallery: I) -> MatchResult
    where
        I: IntoIterator<Item = (Uuid, &'a [f32])>;
}

/// Arg-max cosine matcher with a strict `>` threshold.
///
/// Entries that fail validation (wrong length, NaN) are skipped and count
/// as "no similarity".
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: MATCH_THRESHOLD,
        }
    }
}

impl Matcher for CosineMatcher {
    fn compare<'a, I>(&self, query: &[f32], gallery: I) -> MatchResult
    where
        I: IntoIterator<Item = (Uuid, &'a [f32])>,
    {
        let mut best_similarity = 0.0f32;
        let mut best_user = None;

        for (user_id, candidate) in gallery {
            let similarity = match cosine_similarity(query, candidate) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(%user_id, error = %e, "skipping unusable gallery entry");
                    continue;
                }
            };
            if similarity > best_similarity {
                best_similarity = similarity;
                best_user = Some(user_id);
            }
        }

        let matched = best_similarity > self.threshold;
        MatchResult {
            matched,
            similarity: best_similarity,
            user_id: if matched { best_user } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(seed: u32, len: usize) -> Vec<f32> {
        // Small deterministic LCG so tests do not depend on an RNG crate
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect()
    }

    #[test]
    fn test_identity_is_one() {
        for seed in 0..16 {
            let a = vector(seed, 128);
            let s = cosine_similarity(&a, &a).unwrap();
            assert!((s - 1.0).abs() < 1e-6, "seed {seed}: {s}");
        }
    }

    #[test]
    fn test_zero_vector_is_zero() {
        let zero = vec![0.0f32; 128];
        let b = vector(3, 128);
        assert_eq!(cosine_similarity(&zero, &b).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&b, &zero).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero).unwrap(), 0.0);
    }

    #[test]
    fn test_symmetric() {
        for seed in 0..16 {
            let a = vector(seed, 128);
            let b = vector(seed + 100, 128);
            assert_eq!(
                cosine_similarity(&a, &b).unwrap(),
                cosine_similarity(&b, &a).unwrap()
            );
        }
    }

    #[test]
    fn test_anti_correlated_floors_at_zero() {
        let a = vector(9, 128);
        let neg: Vec<f32> = a.iter().map(|v| -v).collect();
        assert_eq!(cosine_similarity(&a, &neg).unwrap(), 0.0);
    }

    #[test]
    fn test_length_mismatch() {
        let err = cosine_similarity(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert_eq!(err, SimilarityError::LengthMismatch { left: 2, right: 1 });
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = cosine_similarity(&[1.0, f32::NAN], &[1.0, 1.0]).unwrap_err();
        assert_eq!(err, SimilarityError::NonFinite { index: 1 });
    }

    #[test]
    fn test_orthogonal() {
        let s = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert_eq!(s, 0.0);
    }

    #[test]
    fn test_matcher_picks_best_above_threshold() {
        let query = vec![1.0f32, 0.0];
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        // cos = 0.9 and cos = 0.6
        let near_vec = vec![0.9f32, (1.0f32 - 0.81).sqrt()];
        let far_vec = vec![0.6f32, 0.8];
        let gallery = vec![(far, far_vec.as_slice()), (near, near_vec.as_slice())];

        let result = CosineMatcher::default().compare(&query, gallery);
        assert!(result.matched);
        assert_eq!(result.user_id, Some(near));
        assert!((result.similarity - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_below_threshold() {
        let query = vec![1.0f32, 0.0];
        let other = vec![0.8f32, 0.6];
        let result = CosineMatcher::default().compare(&query, [(Uuid::new_v4(), other.as_slice())]);
        assert!(!result.matched);
        assert!(result.user_id.is_none());
        assert!((result.similarity - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let query = vec![1.0f32, 0.0];
        let candidate = vec![1.0f32, 0.0];
        let matcher = CosineMatcher { threshold: 1.0 };
        let result = matcher.compare(&query, [(Uuid::new_v4(), candidate.as_slice())]);
        assert!(!result.matched);
    }

    #[test]
    fn test_matcher_skips_malformed_entries() {
        let query = vec![1.0f32, 0.0];
        let short = vec![1.0f32];
        let good = vec![1.0f32, 0.0];
        let id = Uuid::new_v4();
        let gallery = vec![(Uuid::new_v4(), short.as_slice()), (id, good.as_slice())];
        let result = CosineMatcher::default().compare(&query, gallery);
        assert_eq!(result.user_id, Some(id));
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let result = CosineMatcher::default().compare(&[1.0, 0.0], std::iter::empty());
        assert_eq!(result, MatchResult::no_match());
    }
}
