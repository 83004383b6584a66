use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::gallery::default_extensions;
use facematch_core::{
    list_candidates, EngineSettings, FaceComparator, MatchEngine, Normalizer, ScratchDir,
    VerificationOutcome,
};

const EXIT_MATCH: u8 = 0;
const EXIT_NO_MATCH: u8 = 1;
const EXIT_INPUT_ERROR: u8 = 2;
const EXIT_INTERNAL_ERROR: u8 = 3;

#[derive(Parser)]
#[command(name = "facematch", about = "Verify a face photo against a directory of known faces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a probe photo against the gallery (exit 0 match, 1 no match, 2 bad input, 3 error)
    Verify {
        /// Probe image file
        probe: PathBuf,
        /// Gallery directory
        #[arg(long, default_value = "uploads")]
        gallery: PathBuf,
        /// Directory for normalized artifacts
        #[arg(long)]
        scratch: Option<PathBuf>,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long, default_value = "models")]
        models: PathBuf,
        /// Cosine similarity threshold for a positive match
        #[arg(long, default_value_t = 0.40)]
        threshold: f32,
        /// Fail comparisons where no face is detected
        #[arg(long)]
        enforce_detection: bool,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// List gallery candidates in match-priority order
    List {
        /// Gallery directory
        #[arg(long, default_value = "uploads")]
        gallery: PathBuf,
        /// File name to leave out
        #[arg(long, default_value = "")]
        exclude: String,
        /// Normalize each candidate and report the ones a scan would skip
        #[arg(long)]
        check: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Verify {
            probe,
            gallery,
            scratch,
            models,
            threshold,
            enforce_detection,
            json,
        } => {
            let settings = EngineSettings {
                storage_dir: gallery,
                scratch_dir: scratch.unwrap_or_else(|| EngineSettings::default().scratch_dir),
                ..EngineSettings::default()
            };
            let policy = facematch_core::DetectionPolicy::from_enforce(enforce_detection);
            verify(&probe, settings, &models, threshold, policy, json)
        }
        Commands::List {
            gallery,
            exclude,
            check,
        } => list(&gallery, &exclude, check).map(|()| EXIT_MATCH),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_INTERNAL_ERROR)
        }
    }
}

fn verify(
    probe: &Path,
    settings: EngineSettings,
    models: &Path,
    threshold: f32,
    policy: facematch_core::DetectionPolicy,
    json: bool,
) -> Result<u8> {
    let payload = std::fs::read(probe).with_context(|| format!("reading {}", probe.display()))?;
    let comparator = load_comparator(models, threshold, policy)?;
    let engine = MatchEngine::new(settings, comparator).context("initialising match engine")?;

    tracing::info!(probe = %probe.display(), bytes = payload.len(), "verifying probe");
    let outcome = engine.verify(&payload);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match &outcome {
            VerificationOutcome::Matched { identity } => println!("verified: {identity}"),
            VerificationOutcome::NoMatch => println!("Face not recognized"),
            VerificationOutcome::InputError { reason } => eprintln!("invalid probe: {reason}"),
            VerificationOutcome::InternalError { reason } => eprintln!("error: {reason}"),
        }
    }

    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &VerificationOutcome) -> u8 {
    match outcome {
        VerificationOutcome::Matched { .. } => EXIT_MATCH,
        VerificationOutcome::NoMatch => EXIT_NO_MATCH,
        VerificationOutcome::InputError { .. } => EXIT_INPUT_ERROR,
        VerificationOutcome::InternalError { .. } => EXIT_INTERNAL_ERROR,
    }
}

#[cfg(feature = "onnx")]
fn load_comparator(
    models: &Path,
    threshold: f32,
    policy: facematch_core::DetectionPolicy,
) -> Result<Arc<dyn FaceComparator>> {
    let comparator = facematch_core::ArcFaceComparator::load(models, threshold, policy)
        .with_context(|| format!("loading models from {}", models.display()))?;
    Ok(Arc::new(comparator))
}

#[cfg(not(feature = "onnx"))]
fn load_comparator(
    _models: &Path,
    _threshold: f32,
    _policy: facematch_core::DetectionPolicy,
) -> Result<Arc<dyn FaceComparator>> {
    anyhow::bail!("facematch was built without the `onnx` feature; rebuild with --features onnx")
}

fn list(gallery: &Path, exclude: &str, check: bool) -> Result<()> {
    let extensions = default_extensions();
    let candidates = list_candidates(gallery, exclude, &extensions)?;

    let normalizer = if check {
        let defaults = EngineSettings::default();
        std::fs::create_dir_all(&defaults.scratch_dir)
            .with_context(|| format!("creating {}", defaults.scratch_dir.display()))?;
        Some(Normalizer::new(
            ScratchDir::new(&defaults.scratch_dir),
            defaults.max_edge,
            defaults.jpeg_quality,
        ))
    } else {
        None
    };

    let (mut total, mut skipped) = (0usize, 0usize);
    for candidate in candidates {
        let candidate = candidate?;
        total += 1;
        let Some(normalizer) = &normalizer else {
            println!("{}", candidate.identity());
            continue;
        };
        match normalizer.normalize(candidate.path(), candidate.identity()) {
            Ok(normalized) => {
                let (w, h) = normalized.dimensions();
                println!("{:<40} ok ({w}x{h})", candidate.identity());
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                skipped += 1;
                tracing::warn!(candidate = candidate.identity(), error = %e, "would be skipped by a scan");
                println!("{:<40} SKIP: {e}", candidate.identity());
            }
        }
    }

    tracing::debug!(gallery = %gallery.display(), total, skipped, "listed gallery");
    if check {
        println!("\n{total} candidates, {skipped} would be skipped");
    }
    Ok(())
}
