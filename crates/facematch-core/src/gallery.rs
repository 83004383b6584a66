//! Gallery enumeration: the reference photos a probe is compared against.
//!
//! The gallery is a flat directory. Listing order is the directory's own order
//! and is the only source of match priority.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Extensions accepted when no explicit allow-list is configured.
pub const DEFAULT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot list gallery {path}: {source}")]
    List { path: PathBuf, source: io::Error },
    #[error("cannot read gallery entry in {path}: {source}")]
    Entry { path: PathBuf, source: io::Error },
}

/// One reference photo.
///
/// The file name doubles as the identity reported on a match. Storage location
/// and identity are the same thing here; callers should go through
/// [`GalleryImage::identity`] rather than re-deriving it from the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryImage {
    path: PathBuf,
    identity: String,
}

impl GalleryImage {
    pub fn new(path: PathBuf, identity: String) -> Self {
        Self { path, identity }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

/// Single-pass iterator over gallery candidates.
#[derive(Debug)]
pub struct Candidates {
    dir: PathBuf,
    entries: fs::ReadDir,
    exclude: String,
    extensions: Vec<String>,
}

/// List candidates in `dir`, skipping `exclude` and anything whose extension
/// is not in `extensions` (compared case-insensitively).
pub fn list_candidates(
    dir: &Path,
    exclude: &str,
    extensions: &[String],
) -> Result<Candidates, GalleryError> {
    let entries = fs::read_dir(dir).map_err(|e| GalleryError::List {
        path: dir.to_path_buf(),
        source: e,
    })?;

    Ok(Candidates {
        dir: dir.to_path_buf(),
        entries,
        exclude: exclude.to_string(),
        extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
    })
}

impl Iterator for Candidates {
    type Item = Result<GalleryImage, GalleryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(GalleryError::Entry {
                        path: self.dir.clone(),
                        source: e,
                    }))
                }
            };

            let Ok(name) = entry.file_name().into_string() else {
                tracing::debug!(path = %entry.path().display(), "skipping non-UTF-8 gallery entry");
                continue;
            };
            if name == self.exclude || !has_allowed_extension(&name, &self.extensions) {
                continue;
            }
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            return Some(Ok(GalleryImage::new(entry.path(), name)));
        }
    }
}

/// `extensions` must already be lowercase.
fn has_allowed_extension(name: &str, extensions: &[String]) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|allowed| *allowed == ext)
        }
        _ => false,
    }
}

pub fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}
