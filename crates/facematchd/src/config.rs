use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use facematch_core::engine::EngineSettings;
use facematch_core::gallery::default_extensions;
use facematch_core::normalize::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_DECODE_ALLOC, DEFAULT_MAX_EDGE};
use facematch_core::DetectionPolicy;
use serde::Deserialize;

/// Names the optional TOML file read before environment overrides.
pub const CONFIG_PATH_VAR: &str = "FACEMATCH_CONFIG";

/// Daemon configuration: defaults, then an optional TOML file, then `FACEMATCH_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Gallery directory; uploads are saved here while they are verified.
    pub storage_dir: PathBuf,
    /// Normalized artifacts. Must not be the storage directory.
    pub scratch_dir: PathBuf,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Fail a comparison when no face is detected instead of embedding the whole image.
    pub enforce_detection: bool,
    pub max_edge: u32,
    pub jpeg_quality: u8,
    pub extensions: Vec<String>,
    pub max_upload_mb: usize,
    /// Timeout in seconds for one verification.
    pub verify_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            storage_dir: PathBuf::from("uploads"),
            scratch_dir: std::env::temp_dir().join("facematch-scratch"),
            model_dir: PathBuf::from("models"),
            similarity_threshold: 0.40,
            enforce_detection: false,
            max_edge: DEFAULT_MAX_EDGE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            extensions: default_extensions(),
            max_upload_mb: 10,
            verify_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load from `FACEMATCH_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEMATCH_*` overrides from `lookup`. Values that do not parse
    /// leave the current setting in place.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("FACEMATCH_{name}"));

        if let Some(host) = var("HOST") {
            self.host = host;
        }
        self.port = parsed(var("PORT"), self.port);
        if let Some(dir) = var("STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        self.similarity_threshold = parsed(var("SIMILARITY_THRESHOLD"), self.similarity_threshold);
        self.enforce_detection = flag(var("ENFORCE_DETECTION"), self.enforce_detection);
        self.max_edge = parsed(var("MAX_EDGE"), self.max_edge);
        self.jpeg_quality = parsed(var("JPEG_QUALITY"), self.jpeg_quality);
        self.max_upload_mb = parsed(var("MAX_UPLOAD_MB"), self.max_upload_mb);
        self.verify_timeout_secs = parsed(var("VERIFY_TIMEOUT_SECS"), self.verify_timeout_secs);
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn detection_policy(&self) -> DetectionPolicy {
        DetectionPolicy::from_enforce(self.enforce_detection)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            storage_dir: self.storage_dir.clone(),
            scratch_dir: self.scratch_dir.clone(),
            max_edge: self.max_edge,
            jpeg_quality: self.jpeg_quality,
            extensions: self.extensions.clone(),
            max_decode_alloc: DEFAULT_MAX_DECODE_ALLOC,
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>, current: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(current)
}

fn flag(value: Option<String>, current: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("1" | "true" | "TRUE" | "yes" | "on") => true,
        Some("0" | "false" | "FALSE" | "no" | "off") => false,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.storage_dir, PathBuf::from("uploads"));
        assert_eq!(config.max_edge, 224);
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.max_upload_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.verify_timeout(), Duration::from_secs(30));
        assert_eq!(config.detection_policy(), DetectionPolicy::Relaxed);
        assert!(config.engine_settings().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("FACEMATCH_PORT", "9100"),
            ("FACEMATCH_STORAGE_DIR", "/srv/gallery"),
            ("FACEMATCH_SIMILARITY_THRESHOLD", "0.55"),
            ("FACEMATCH_ENFORCE_DETECTION", "1"),
            ("FACEMATCH_MAX_EDGE", "160"),
        ]));
        assert_eq!(config.port, 9100);
        assert_eq!(config.storage_dir, PathBuf::from("/srv/gallery"));
        assert!((config.similarity_threshold - 0.55).abs() < 1e-6);
        assert_eq!(config.detection_policy(), DetectionPolicy::Enforce);
        assert_eq!(config.engine_settings().max_edge, 160);
    }

    #[test]
    fn test_unparseable_env_keeps_current() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("FACEMATCH_PORT", "eighty"),
            ("FACEMATCH_JPEG_QUALITY", "300"),
            ("FACEMATCH_ENFORCE_DETECTION", "maybe"),
        ]));
        assert_eq!(config.port, 8000);
        assert_eq!(config.jpeg_quality, 85);
        assert!(!config.enforce_detection);
    }

    #[test]
    fn test_toml_partial() {
        let config = Config::from_toml_str(
            r#"
            port = 5001
            model_dir = "/opt/models"
            extensions = ["jpg", "webp"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 5001);
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.extensions, vec!["jpg", "webp"]);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_toml_then_env() {
        let mut config = Config::from_toml_str("port = 5001\nmax_upload_mb = 2").unwrap();
        config.apply_overrides(env(&[("FACEMATCH_PORT", "7000")]));
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_upload_mb, 2);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(Config::from_toml_str("camera_device = \"/dev/video2\"").is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/facematch.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
