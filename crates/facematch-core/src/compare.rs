//! The same-person decision between two normalized images.
//!
//! The engine only sees [`FaceComparator`]; how the decision is made is up to
//! the implementation. [`ArcFaceComparator`] (feature `onnx`) detects, aligns
//! and embeds both faces and thresholds their cosine similarity.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::normalize::NormalizedImage;
use crate::types::{Embedding, Verdict};

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("cannot load {source_label}: {error}")]
    Load {
        source_label: String,
        error: image::ImageError,
    },
    #[error("no face detected in {0}")]
    NoFace(String),
    #[error("detector: {0}")]
    Detector(#[from] crate::detector::DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] crate::recognizer::RecognizerError),
    #[error("comparator state poisoned by an earlier panic")]
    Poisoned,
    #[error("{0}")]
    Other(String),
}

impl CompareError {
    /// A broken comparator, as opposed to a failure on one particular pair.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompareError::Poisoned)
    }
}

/// What to do when the detector finds no face in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionPolicy {
    /// Fail the comparison.
    Enforce,
    /// Embed the whole image instead of an aligned face crop.
    #[default]
    Relaxed,
}

impl DetectionPolicy {
    pub fn from_enforce(enforce: bool) -> Self {
        if enforce {
            DetectionPolicy::Enforce
        } else {
            DetectionPolicy::Relaxed
        }
    }
}

/// Opaque same-person primitive.
///
/// Implementations are shared by concurrent verifications and must not keep
/// per-request state.
pub trait FaceComparator: Send + Sync {
    fn compare(&self, a: &NormalizedImage, b: &NormalizedImage) -> Result<Verdict, CompareError>;

    /// Short name for logs and status output.
    fn name(&self) -> &str;
}

/// Recently computed embeddings keyed by normalized-artifact path.
///
/// Artifact paths are unique per artifact, so a hit is always the same image.
/// Lets a probe be embedded once per scan instead of once per candidate.
#[derive(Debug)]
pub struct EmbeddingCache {
    slots: Mutex<VecDeque<(PathBuf, Embedding)>>,
    capacity: usize,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Cached embedding for `key`, or the result of `compute`. Failures are not cached.
    ///
    /// The lock is not held while `compute` runs.
    pub fn get_or_compute(
        &self,
        key: &Path,
        compute: impl FnOnce() -> Result<Embedding, CompareError>,
    ) -> Result<Embedding, CompareError> {
        {
            let slots = self.slots.lock().map_err(|_| CompareError::Poisoned)?;
            if let Some((_, hit)) = slots.iter().find(|(path, _)| path == key) {
                return Ok(hit.clone());
            }
        }

        let embedding = compute()?;

        let mut slots = self.slots.lock().map_err(|_| CompareError::Poisoned)?;
        if !slots.iter().any(|(path, _)| path == key) {
            slots.push_front((key.to_path_buf(), embedding.clone()));
            slots.truncate(self.capacity);
        }
        Ok(embedding)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(feature = "onnx")]
pub use onnx::{ArcFaceComparator, DET_MODEL_FILE, REC_MODEL_FILE};

#[cfg(feature = "onnx")]
mod onnx {
    use std::sync::Mutex;

    use image::RgbImage;

    use super::{CompareError, DetectionPolicy, EmbeddingCache, FaceComparator};
    use crate::alignment::align_face;
    use crate::detector::FaceDetector;
    use crate::normalize::NormalizedImage;
    use crate::recognizer::FaceRecognizer;
    use crate::types::{Embedding, Verdict};

    pub const DET_MODEL_FILE: &str = "det_10g.onnx";
    pub const REC_MODEL_FILE: &str = "w600k_r50.onnx";

    /// Probes held at once; roughly the number of concurrent scans.
    const PROBE_CACHE_SLOTS: usize = 16;

    /// SCRFD + ArcFace comparator.
    ///
    /// ONNX sessions need exclusive access while running, so inference is
    /// serialized per model; everything else is read-only.
    pub struct ArcFaceComparator {
        detector: Mutex<FaceDetector>,
        recognizer: Mutex<FaceRecognizer>,
        /// Embeddings of the left-hand (probe) side, reused across a scan.
        probes: EmbeddingCache,
        threshold: f32,
        policy: DetectionPolicy,
    }

    impl ArcFaceComparator {
        /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
        pub fn load(
            model_dir: &std::path::Path,
            threshold: f32,
            policy: DetectionPolicy,
        ) -> Result<Self, CompareError> {
            let det = model_dir.join(DET_MODEL_FILE);
            let rec = model_dir.join(REC_MODEL_FILE);
            let detector = FaceDetector::load(&det.to_string_lossy())?;
            let recognizer = FaceRecognizer::load(&rec.to_string_lossy())?;

            tracing::info!(threshold, ?policy, "ArcFace comparator ready");

            Ok(Self {
                detector: Mutex::new(detector),
                recognizer: Mutex::new(recognizer),
                probes: EmbeddingCache::new(PROBE_CACHE_SLOTS),
                threshold,
                policy,
            })
        }

        fn embed(&self, image: &NormalizedImage) -> Result<Embedding, CompareError> {
            let rgb: RgbImage = image::open(image.path())
                .map_err(|error| CompareError::Load {
                    source_label: image.source().to_string(),
                    error,
                })?
                .to_rgb8();

            let faces = self
                .detector
                .lock()
                .map_err(|_| CompareError::Poisoned)?
                .detect(&rgb)?;

            let crop = match faces.iter().find_map(|f| f.landmarks) {
                Some(landmarks) => align_face(&rgb, &landmarks),
                None if self.policy == DetectionPolicy::Relaxed => {
                    tracing::debug!(source = image.source(), "no face detected; embedding whole image");
                    rgb
                }
                None => return Err(CompareError::NoFace(image.source().to_string())),
            };

            let embedding = self
                .recognizer
                .lock()
                .map_err(|_| CompareError::Poisoned)?
                .embed(&crop)?;
            Ok(embedding)
        }
    }

    impl FaceComparator for ArcFaceComparator {
        fn compare(&self, a: &NormalizedImage, b: &NormalizedImage) -> Result<Verdict, CompareError> {
            let probe = self.probes.get_or_compute(a.path(), || self.embed(a))?;
            let similarity = probe.similarity(&self.embed(b)?);
            Ok(Verdict {
                matched: similarity >= self.threshold,
                similarity,
            })
        }

        fn name(&self) -> &str {
            "arcface-w600k_r50"
        }
    }
}
