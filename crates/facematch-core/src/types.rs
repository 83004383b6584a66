use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g. "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
        for (a, b) in self.values.iter().zip(&other.values) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// Same-person decision for one pair of normalized images.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    pub matched: bool,
    /// Comparator-specific score, reported for logging only.
    pub similarity: f32,
}

/// Terminal result of one verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// `identity` is the matched gallery file's name.
    Matched { identity: String },
    NoMatch,
    InputError { reason: String },
    InternalError { reason: String },
}

impl VerificationOutcome {
    pub fn identity(&self) -> Option<&str> {
        match self {
            VerificationOutcome::Matched { identity } => Some(identity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_similarity_identical() {
        assert!((emb(&[1.0, 0.0, 0.0]).similarity(&emb(&[1.0, 0.0, 0.0])) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_similarity_scale_invariant() {
        assert!((emb(&[2.0, 2.0]).similarity(&emb(&[5.0, 5.0])) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_outcome_identity() {
        let matched = VerificationOutcome::Matched { identity: "bob.jpg".into() };
        assert_eq!(matched.identity(), Some("bob.jpg"));
        assert_eq!(VerificationOutcome::NoMatch.identity(), None);
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(VerificationOutcome::Matched { identity: "bob.jpg".into() }).unwrap();
        assert_eq!(json["outcome"], "matched");
        assert_eq!(json["identity"], "bob.jpg");
    }
}
