//! ArcFace embeddings from aligned 112×112 RGB face crops.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

use crate::alignment::ALIGNED_SIZE;
use crate::types::Embedding;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// NCHW tensor for a face crop. Crops that are not 112×112 are stretched to fit.
pub fn input_tensor(face: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let resized;
    let face = if face.dimensions() == (size, size) {
        face
    } else {
        resized = imageops::resize(face, size, size, FilterType::Triangle);
        &resized
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

/// Wrap raw model output as a unit-length embedding.
pub fn embedding_from_raw(raw: Vec<f32>) -> Result<Embedding, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }

    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    let values = if norm > 0.0 {
        raw.into_iter().map(|v| v / norm).collect()
    } else {
        raw
    };

    Ok(Embedding {
        values,
        model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
    })
}

/// ArcFace recognizer backed by an ONNX Runtime session.
#[cfg(feature = "onnx")]
pub struct FaceRecognizer {
    session: ort::session::Session,
}

#[cfg(feature = "onnx")]
impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        use ort::session::Session;

        if !std::path::Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        use ort::value::TensorRef;

        let input = input_tensor(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        embedding_from_raw(raw.to_vec())
    }
}
