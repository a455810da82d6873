//! Embedding comparison and the identity-match decision.

use thiserror::Error;

/// Dimensionality of the face embedding space. Fixed by the recognition model.
pub const EMBEDDING_DIM: usize = 128;

/// Default maximum embedding distance accepted as a positive match.
pub const DEFAULT_DISTANCE_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidDimension(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    NonFiniteValue,
}

/// A fixed-length face embedding. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    values: Vec<f32>,
}

impl FaceEmbedding {
    /// Validate dimensionality and finiteness up front so every later
    /// distance computation can assume a well-formed vector.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::InvalidDimension(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFiniteValue);
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Euclidean distance between two embeddings.
///
/// Mismatched dimensionality is a programming error (the dimension is fixed
/// by the model and enforced at construction), not a runtime policy decision.
pub fn euclidean_distance(a: &FaceEmbedding, b: &FaceEmbedding) -> f32 {
    assert_eq!(
        a.dim(),
        b.dim(),
        "embedding dimensionality mismatch: {} vs {}",
        a.dim(),
        b.dim()
    );
    a.values()
        .iter()
        .zip(b.values())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Result of comparing a stored embedding against a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// `distance <= tolerance`.
    pub is_match: bool,
    /// Raw Euclidean distance between the embeddings.
    pub distance: f32,
    /// `(1 - distance) * 100`. Only meaningful relative to the embedding
    /// space the tolerance was calibrated against (here: L2-normalized
    /// 128-d vectors); it is a display figure, not an independent signal,
    /// and is deliberately not clamped or re-derived from `is_match`.
    pub confidence_percent: f32,
}

impl MatchResult {
    /// The acceptance policy used by the orchestrator: the distance check and
    /// the confidence check, both derived from the single configured
    /// tolerance. With the confidence formula above the second check amounts
    /// to `distance <= 1 - tolerance`, so for the default tolerance of 0.6
    /// the confidence gate is the stricter of the two. Both are kept, and
    /// both follow the one configured value.
    pub fn accepted(&self, tolerance: f32) -> bool {
        self.is_match && self.confidence_percent >= tolerance * 100.0
    }
}

/// Compare a stored embedding to a freshly extracted probe.
pub fn compare(stored: &FaceEmbedding, probe: &FaceEmbedding, tolerance: f32) -> MatchResult {
    let distance = euclidean_distance(stored, probe);
    MatchResult {
        is_match: distance <= tolerance,
        distance,
        confidence_percent: (1.0 - distance) * 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(fill: f32) -> FaceEmbedding {
        FaceEmbedding::new(vec![fill; EMBEDDING_DIM]).unwrap()
    }

    fn embedding_with(first: f32) -> FaceEmbedding {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = first;
        FaceEmbedding::new(v).unwrap()
    }

    #[test]
    fn rejects_wrong_dimension() {
        let err = FaceEmbedding::new(vec![0.5; 64]).unwrap_err();
        assert_eq!(err, EmbeddingError::InvalidDimension(64));
    }

    #[test]
    fn rejects_non_finite() {
        let mut v = vec![0.5; EMBEDDING_DIM];
        v[7] = f32::NAN;
        assert_eq!(
            FaceEmbedding::new(v).unwrap_err(),
            EmbeddingError::NonFiniteValue
        );
        let mut v = vec![0.5; EMBEDDING_DIM];
        v[0] = f32::INFINITY;
        assert_eq!(
            FaceEmbedding::new(v).unwrap_err(),
            EmbeddingError::NonFiniteValue
        );
    }

    #[test]
    fn identical_embeddings_full_confidence() {
        let e = embedding(0.25);
        let r = compare(&e, &e, DEFAULT_DISTANCE_TOLERANCE);
        assert!(r.is_match);
        assert_eq!(r.distance, 0.0);
        assert_eq!(r.confidence_percent, 100.0);
        assert!(r.accepted(DEFAULT_DISTANCE_TOLERANCE));
    }

    #[test]
    fn distance_is_symmetric() {
        let a = embedding_with(0.3);
        let b = embedding_with(0.9);
        assert_eq!(euclidean_distance(&a, &b), euclidean_distance(&b, &a));
    }

    #[test]
    fn known_distance() {
        // Differs only in one coordinate by 0.5.
        let a = embedding_with(0.0);
        let b = embedding_with(0.5);
        let r = compare(&a, &b, DEFAULT_DISTANCE_TOLERANCE);
        assert!((r.distance - 0.5).abs() < 1e-6);
        assert!(r.is_match);
        assert!((r.confidence_percent - 50.0).abs() < 1e-4);
    }

    #[test]
    fn beyond_tolerance_never_matches() {
        let a = embedding_with(0.0);
        let b = embedding_with(0.7);
        for tolerance in [0.0, 0.1, 0.3, 0.5, 0.69] {
            let r = compare(&a, &b, tolerance);
            assert!(!r.is_match, "tolerance {tolerance}");
            assert!(!r.accepted(tolerance));
        }
        let r = compare(&a, &b, 0.7);
        assert!(r.is_match);
    }

    #[test]
    fn confidence_gate_is_the_binding_check() {
        // distance 0.5 is within the 0.6 tolerance, but confidence 50 falls
        // short of tolerance * 100 — the acceptance policy rejects it.
        let a = embedding_with(0.0);
        let b = embedding_with(0.5);
        let r = compare(&a, &b, DEFAULT_DISTANCE_TOLERANCE);
        assert!(r.is_match);
        assert!(!r.accepted(DEFAULT_DISTANCE_TOLERANCE));

        // distance 0.3 passes both checks.
        let c = embedding_with(0.3);
        let r = compare(&a, &c, DEFAULT_DISTANCE_TOLERANCE);
        assert!(r.is_match);
        assert!(r.accepted(DEFAULT_DISTANCE_TOLERANCE));
    }

    #[test]
    #[should_panic(expected = "dimensionality mismatch")]
    fn dimension_mismatch_panics() {
        // Bypass the validating constructor to simulate a programming error.
        let a = FaceEmbedding {
            values: vec![0.0; EMBEDDING_DIM],
        };
        let b = FaceEmbedding {
            values: vec![0.0; EMBEDDING_DIM / 2],
        };
        let _ = euclidean_distance(&a, &b);
    }
}
