//! Image normalization: decode, convert to RGB, bound the size, re-encode as JPEG.
//!
//! Every image is normalized before it reaches the comparator so that the cost
//! of a comparison does not depend on how large the uploaded or stored photo is.

use std::io;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageReader, Limits, RgbImage};
use thiserror::Error;

use crate::scratch::{ScratchDir, ScratchFile};

pub const DEFAULT_MAX_EDGE: u32 = 224;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
/// Decoder allocation ceiling per image.
pub const DEFAULT_MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

const SCRATCH_PREFIX: &str = "resized";
const SCRATCH_EXT: &str = "jpg";

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("cannot read {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("cannot encode normalized image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("cannot write scratch artifact: {0}")]
    Scratch(#[source] io::Error),
}

impl NormalizeError {
    /// Scratch storage failures are infrastructure problems; everything else
    /// is specific to the one source image.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NormalizeError::Scratch(_))
    }
}

/// A normalized copy of one source image, backed by a scratch file.
///
/// The scratch file is deleted when this value is dropped.
#[derive(Debug)]
pub struct NormalizedImage {
    source: String,
    width: u32,
    height: u32,
    file: ScratchFile,
}

impl NormalizedImage {
    /// Label of the image this was derived from (gallery identity or "probe").
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Delete the backing file now instead of at drop.
    pub fn release(&mut self) -> io::Result<()> {
        self.file.release()
    }
}

/// Stateless single-image transform writing into a scratch directory.
#[derive(Debug, Clone)]
pub struct Normalizer {
    scratch: ScratchDir,
    max_edge: u32,
    quality: u8,
    max_alloc: u64,
}

impl Normalizer {
    pub fn new(scratch: ScratchDir, max_edge: u32, quality: u8) -> Self {
        Self {
            scratch,
            max_edge,
            quality,
            max_alloc: DEFAULT_MAX_DECODE_ALLOC,
        }
    }

    pub fn with_max_alloc(mut self, bytes: u64) -> Self {
        self.max_alloc = bytes;
        self
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Normalize the image at `source`.
    ///
    /// On success exactly one new scratch file exists; on failure none does.
    pub fn normalize(&self, source: &Path, label: &str) -> Result<NormalizedImage, NormalizeError> {
        let rgb = self.decode(source)?;
        let (orig_w, orig_h) = rgb.dimensions();
        let (width, height) = bounded_dimensions(orig_w, orig_h, self.max_edge);

        let rgb = if (width, height) == (orig_w, orig_h) {
            rgb
        } else {
            imageops::resize(&rgb, width, height, FilterType::Lanczos3)
        };

        let mut encoded = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut encoded, self.quality))
            .map_err(NormalizeError::Encode)?;

        let file = self
            .scratch
            .create(SCRATCH_PREFIX, SCRATCH_EXT, &encoded)
            .map_err(NormalizeError::Scratch)?;

        tracing::debug!(
            source = label,
            from = ?(orig_w, orig_h),
            to = ?(width, height),
            path = %file.path().display(),
            "normalized image"
        );

        Ok(NormalizedImage {
            source: label.to_string(),
            width,
            height,
            file,
        })
    }

    /// Decode by content sniffing, not by extension: uploads are always saved
    /// as `.jpg` whatever their real format.
    fn decode(&self, source: &Path) -> Result<RgbImage, NormalizeError> {
        let open_err = |e: io::Error| NormalizeError::Open {
            path: source.to_path_buf(),
            source: e,
        };

        let mut reader = ImageReader::open(source)
            .map_err(open_err)?
            .with_guessed_format()
            .map_err(open_err)?;

        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_alloc);
        reader.limits(limits);

        let image = reader.decode().map_err(|e| NormalizeError::Decode {
            path: source.to_path_buf(),
            source: e,
        })?;

        Ok(image.to_rgb8())
    }
}

/// Fit `width × height` inside a `max_edge` square, preserving aspect ratio.
/// Images that already fit are left alone (never upscaled).
pub fn bounded_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width <= max_edge && height <= max_edge {
        return (width, height);
    }
    let scale = max_edge as f64 / width.max(height) as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_edge);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_edge);
    (w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb};
    use std::fs;
    use tempfile::TempDir;

    fn normalizer(scratch: &Path) -> Normalizer {
        Normalizer::new(ScratchDir::new(scratch), DEFAULT_MAX_EDGE, DEFAULT_JPEG_QUALITY)
    }

    fn write_rgb(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    fn scratch_entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_bounded_dimensions_landscape() {
        assert_eq!(bounded_dimensions(1000, 500, 224), (224, 112));
    }

    #[test]
    fn test_bounded_dimensions_portrait() {
        assert_eq!(bounded_dimensions(480, 640, 224), (168, 224));
    }

    #[test]
    fn test_bounded_dimensions_no_upscale() {
        assert_eq!(bounded_dimensions(100, 50, 224), (100, 50));
        assert_eq!(bounded_dimensions(224, 224, 224), (224, 224));
    }

    #[test]
    fn test_bounded_dimensions_extreme_aspect() {
        assert_eq!(bounded_dimensions(3000, 1, 224), (224, 1));
    }

    #[test]
    fn test_normalize_downscales_and_writes_jpeg() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = write_rgb(src.path(), "wide.png", 640, 480);

        let n = normalizer(scratch.path());
        let out = n.normalize(&path, "wide.png").unwrap();

        assert_eq!(out.dimensions(), (224, 168));
        assert_eq!(out.source(), "wide.png");
        assert!(out.path().starts_with(scratch.path()));
        assert_eq!(
            image::ImageFormat::from_path(out.path()).unwrap(),
            image::ImageFormat::Jpeg
        );
        let decoded = image::open(out.path()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (224, 168));
        assert_eq!(n.scratch().live(), 1);
    }

    #[test]
    fn test_normalize_small_image_keeps_size() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = write_rgb(src.path(), "small.png", 64, 48);

        let out = normalizer(scratch.path()).normalize(&path, "small.png").unwrap();
        assert_eq!(out.dimensions(), (64, 48));
    }

    #[test]
    fn test_normalize_grayscale_becomes_rgb() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = src.path().join("gray.png");
        GrayImage::from_pixel(32, 32, Luma([77])).save(&path).unwrap();

        let out = normalizer(scratch.path()).normalize(&path, "gray.png").unwrap();
        let decoded = image::open(out.path()).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
    }

    #[test]
    fn test_normalize_sniffs_format_not_extension() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let png = write_rgb(src.path(), "real.png", 40, 40);
        let disguised = src.path().join("temp_upload.jpg");
        fs::copy(&png, &disguised).unwrap();

        assert!(normalizer(scratch.path()).normalize(&disguised, "probe").is_ok());
    }

    #[test]
    fn test_normalize_drop_removes_artifact() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = write_rgb(src.path(), "a.png", 300, 300);

        let n = normalizer(scratch.path());
        let out = n.normalize(&path, "a.png").unwrap();
        let artifact = out.path().to_path_buf();
        assert!(artifact.exists());
        drop(out);
        assert!(!artifact.exists());
        assert_eq!(scratch_entries(scratch.path()), 0);
        assert_eq!(n.scratch().live(), 0);
    }

    #[test]
    fn test_normalize_corrupt_file_leaves_nothing() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = src.path().join("corrupt.jpg");
        fs::write(&path, b"\xff\xd8\xff\xe0 definitely not a jpeg").unwrap();

        let err = normalizer(scratch.path()).normalize(&path, "corrupt.jpg").unwrap_err();
        assert!(matches!(err, NormalizeError::Decode { .. }), "got {err:?}");
        assert!(!err.is_fatal());
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[test]
    fn test_normalize_empty_file_is_decode_error() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = src.path().join("empty.jpg");
        fs::write(&path, b"").unwrap();

        let err = normalizer(scratch.path()).normalize(&path, "empty.jpg").unwrap_err();
        assert!(matches!(err, NormalizeError::Decode { .. }), "got {err:?}");
    }

    #[test]
    fn test_normalize_missing_source_is_open_error() {
        let scratch = TempDir::new().unwrap();
        let err = normalizer(scratch.path())
            .normalize(Path::new("/nonexistent/face.jpg"), "face.jpg")
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Open { .. }), "got {err:?}");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_normalize_unwritable_scratch_is_fatal() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = write_rgb(src.path(), "a.png", 20, 20);

        let err = normalizer(&scratch.path().join("gone"))
            .normalize(&path, "a.png")
            .unwrap_err();
        assert!(err.is_fatal(), "got {err:?}");
    }

    #[test]
    fn test_normalize_identical_inputs_identical_outputs() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let a = write_rgb(src.path(), "a.png", 500, 400);
        let b = src.path().join("b.png");
        fs::copy(&a, &b).unwrap();

        let n = normalizer(scratch.path());
        let na = n.normalize(&a, "a.png").unwrap();
        let nb = n.normalize(&b, "b.png").unwrap();
        assert_ne!(na.path(), nb.path());
        assert_eq!(fs::read(na.path()).unwrap(), fs::read(nb.path()).unwrap());
    }

    #[test]
    fn test_decode_limit_rejects_oversized() {
        let src = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let path = write_rgb(src.path(), "big.png", 400, 400);

        let err = normalizer(scratch.path())
            .with_max_alloc(1024)
            .normalize(&path, "big.png")
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Decode { .. }), "got {err:?}");
        assert_eq!(scratch_entries(scratch.path()), 0);
    }
}
