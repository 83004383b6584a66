//! Match engine: probe-vs-gallery scan with first-match early exit.
//!
//! One call to [`MatchEngine::verify`] walks these states:
//!
//! ```text
//! Received → ProbeNormalized → Scanning → {Matched | Exhausted} → CleanedUp
//! ```
//!
//! Scratch resources are held by guards scoped to the probe (saved upload and
//! its normalized copy) and to each candidate (its normalized copy), so
//! `CleanedUp` is reached on every path, including unwinding.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::compare::{CompareError, FaceComparator};
use crate::gallery::{self, GalleryError, GalleryImage};
use crate::normalize::{
    NormalizeError, NormalizedImage, Normalizer, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_DECODE_ALLOC,
    DEFAULT_MAX_EDGE,
};
use crate::scratch::{ScratchDir, ScratchFile};
use crate::types::VerificationOutcome;

/// Uploads are saved as `temp_<uuid>.jpg` in the gallery directory.
const UPLOAD_PREFIX: &str = "temp";
const UPLOAD_EXT: &str = "jpg";
const PROBE_LABEL: &str = "probe";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no image payload supplied")]
    EmptyPayload,
    #[error("invalid probe image: {0}")]
    InvalidProbe(#[source] NormalizeError),
    #[error("scratch storage failure: {0}")]
    Scratch(#[source] NormalizeError),
    #[error("cannot save upload: {0}")]
    SaveUpload(#[source] io::Error),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("comparator unusable: {0}")]
    Comparator(#[source] CompareError),
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("cannot prepare directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },
}

impl EngineError {
    /// Errors caused by the request itself rather than by the service.
    pub fn is_input_error(&self) -> bool {
        matches!(self, EngineError::EmptyPayload | EngineError::InvalidProbe(_))
    }
}

/// Explicit service context handed to [`MatchEngine::new`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Gallery directory. Uploads are written here for the duration of a call.
    pub storage_dir: PathBuf,
    /// Directory for normalized artifacts; must differ from `storage_dir`.
    pub scratch_dir: PathBuf,
    pub max_edge: u32,
    pub jpeg_quality: u8,
    /// Gallery extension allow-list, without dots.
    pub extensions: Vec<String>,
    pub max_decode_alloc: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("uploads"),
            scratch_dir: std::env::temp_dir().join("facematch-scratch"),
            max_edge: DEFAULT_MAX_EDGE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            extensions: gallery::default_extensions(),
            max_decode_alloc: DEFAULT_MAX_DECODE_ALLOC,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_edge == 0 {
            return Err(EngineError::Settings("max_edge must be positive".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(EngineError::Settings(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.extensions.is_empty() {
            return Err(EngineError::Settings("extension allow-list is empty".into()));
        }
        if self.scratch_dir == self.storage_dir {
            return Err(EngineError::Settings(
                "scratch_dir must be separate from storage_dir".into(),
            ));
        }
        Ok(())
    }
}

/// How one candidate ended. Fatal problems travel as `Err(EngineError)` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateResult {
    Match,
    NoMatch,
    Skipped,
}

#[derive(Debug, Default)]
struct ScanStats {
    seen: usize,
    compared: usize,
    skipped: usize,
}

pub struct MatchEngine {
    settings: EngineSettings,
    uploads: ScratchDir,
    normalizer: Normalizer,
    comparator: Arc<dyn FaceComparator>,
}

impl MatchEngine {
    /// Validate `settings` and create the storage and scratch directories.
    pub fn new(
        settings: EngineSettings,
        comparator: Arc<dyn FaceComparator>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        for dir in [&settings.storage_dir, &settings.scratch_dir] {
            fs::create_dir_all(dir).map_err(|e| EngineError::Directory {
                path: dir.clone(),
                source: e,
            })?;
        }

        let normalizer = Normalizer::new(
            ScratchDir::new(&settings.scratch_dir),
            settings.max_edge,
            settings.jpeg_quality,
        )
        .with_max_alloc(settings.max_decode_alloc);

        tracing::info!(
            storage = %settings.storage_dir.display(),
            scratch = %settings.scratch_dir.display(),
            max_edge = settings.max_edge,
            comparator = comparator.name(),
            "match engine ready"
        );

        Ok(Self {
            uploads: ScratchDir::new(&settings.storage_dir),
            settings,
            normalizer,
            comparator,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn comparator_name(&self) -> &str {
        self.comparator.name()
    }

    /// Artifacts currently held by in-flight verifications (uploads + normalized copies).
    pub fn scratch_in_use(&self) -> usize {
        self.uploads.live() + self.normalizer.scratch().live()
    }

    /// Does `payload` match any gallery image?
    ///
    /// Blocking; run it on a worker dedicated to the request.
    pub fn verify(&self, payload: &[u8]) -> VerificationOutcome {
        let request = Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!("verify", request = %request);
        let _enter = span.enter();

        match self.run(payload) {
            Ok(Some(entry)) => {
                tracing::info!(identity = entry.identity(), "face verified");
                VerificationOutcome::Matched {
                    identity: entry.identity().to_string(),
                }
            }
            Ok(None) => {
                tracing::info!("no matching face found");
                VerificationOutcome::NoMatch
            }
            Err(e) if e.is_input_error() => {
                tracing::warn!(error = %e, "rejected probe");
                VerificationOutcome::InputError {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "verification failed");
                VerificationOutcome::InternalError {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn run(&self, payload: &[u8]) -> Result<Option<GalleryImage>, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }

        // Received. Guards drop in reverse order: probe copy, then upload.
        let upload = self.save_upload(payload)?;
        let probe = self
            .normalizer
            .normalize(upload.path(), PROBE_LABEL)
            .map_err(|e| {
                if e.is_fatal() {
                    EngineError::Scratch(e)
                } else {
                    EngineError::InvalidProbe(e)
                }
            })?;

        // Scanning.
        let candidates = gallery::list_candidates(
            &self.settings.storage_dir,
            upload.file_name(),
            &self.settings.extensions,
        )?;

        let mut stats = ScanStats::default();
        for candidate in candidates {
            let candidate = candidate?;
            stats.seen += 1;
            match self.examine(&probe, &candidate)? {
                CandidateResult::Match => {
                    stats.compared += 1;
                    tracing::debug!(?stats, "scan stopped at first match");
                    return Ok(Some(candidate));
                }
                CandidateResult::NoMatch => stats.compared += 1,
                CandidateResult::Skipped => stats.skipped += 1,
            }
        }

        tracing::debug!(?stats, "gallery exhausted");
        Ok(None)
    }

    fn save_upload(&self, payload: &[u8]) -> Result<ScratchFile, EngineError> {
        let upload = self
            .uploads
            .create(UPLOAD_PREFIX, UPLOAD_EXT, payload)
            .map_err(EngineError::SaveUpload)?;
        tracing::info!(path = %upload.path().display(), bytes = payload.len(), "saved upload");
        Ok(upload)
    }

    /// Normalize and compare one candidate. Its scratch copy is released
    /// before this returns, whatever the result.
    fn examine(
        &self,
        probe: &NormalizedImage,
        candidate: &GalleryImage,
    ) -> Result<CandidateResult, EngineError> {
        let normalized = match self.normalizer.normalize(candidate.path(), candidate.identity()) {
            Ok(n) => n,
            Err(e) if e.is_fatal() => return Err(EngineError::Scratch(e)),
            Err(e) => {
                tracing::warn!(candidate = candidate.identity(), error = %e, "skipping unreadable gallery image");
                return Ok(CandidateResult::Skipped);
            }
        };

        match self.comparator.compare(probe, &normalized) {
            Ok(verdict) => {
                tracing::debug!(
                    candidate = candidate.identity(),
                    matched = verdict.matched,
                    similarity = verdict.similarity,
                    "compared"
                );
                Ok(if verdict.matched {
                    CandidateResult::Match
                } else {
                    CandidateResult::NoMatch
                })
            }
            Err(e) if e.is_fatal() => Err(EngineError::Comparator(e)),
            Err(e) => {
                tracing::warn!(candidate = candidate.identity(), error = %e, "comparison failed; skipping");
                Ok(CandidateResult::Skipped)
            }
        }
    }
}
