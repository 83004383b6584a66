//! facematch-core: one-to-many face verification against a directory of photos.
//!
//! A probe image is normalized, then compared with each gallery image in turn
//! until the first match. Comparison sits behind [`FaceComparator`]; the
//! ONNX Runtime implementation (SCRFD detection + ArcFace recognition) is
//! available with the `onnx` feature.

pub mod alignment;
pub mod compare;
pub mod detector;
pub mod engine;
pub mod gallery;
pub mod normalize;
pub mod recognizer;
pub mod scratch;
pub mod types;

pub use compare::{CompareError, DetectionPolicy, FaceComparator};
pub use engine::{EngineError, EngineSettings, MatchEngine};
pub use gallery::{list_candidates, GalleryError, GalleryImage};
pub use normalize::{NormalizeError, NormalizedImage, Normalizer};
pub use scratch::{ScratchDir, ScratchFile};
pub use types::{BoundingBox, Embedding, VerificationOutcome, Verdict};

#[cfg(feature = "onnx")]
pub use compare::ArcFaceComparator;
