//! ArcFace face embedder via ONNX Runtime.
//!
//! Extracts 512-dimensional unit embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::frame::Frame;
use crate::types::{Detection, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks — detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Extract a unit embedding from a detected face in a grayscale frame.
    ///
    /// The face must carry landmarks; it is aligned to the canonical
    /// 112×112 position before extraction.
    pub fn extract(&mut self, frame: &Frame, face: &Detection) -> Result<Embedding, EmbedderError> {
        let landmarks = face.landmarks.as_ref().ok_or(EmbedderError::NoLandmarks)?;
        let aligned = alignment::align_face(&frame.data, frame.width, frame.height, landmarks);
        self.embed_crop(&aligned)
    }

    /// Embed a canonical 112×112 grayscale crop.
    ///
    /// Output is always L2-normalized: two embeddings compare via plain
    /// dot product. A dimension mismatch is fatal to this call only.
    pub fn embed_crop(&mut self, aligned: &[u8]) -> Result<Embedding, EmbedderError> {
        let input = preprocess(aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::DimensionMismatch {
                expected: ARCFACE_EMBEDDING_DIM,
                actual: raw.len(),
            });
        }

        Ok(Embedding::from_raw(raw))
    }
}

/// Preprocess a 112×112 grayscale aligned crop into a NCHW float tensor:
/// planar layout, fixed per-channel mean/std (model constants).
fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
    debug_assert_eq!(ARCFACE_INPUT_SIZE, ALIGNED_SIZE);
    let size = ARCFACE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let pixel = aligned_face.get(y * size + x).copied().unwrap_or(0) as f32;

            let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = vec![128u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = vec![128u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let tensor = preprocess(&aligned);
        let val = tensor[[0, 0, 0, 0]];
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_channels_identical() {
        // All 3 channels should be identical for grayscale input
        let aligned = vec![100u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let tensor = preprocess(&aligned);
        for y in 0..ARCFACE_INPUT_SIZE {
            for x in 0..ARCFACE_INPUT_SIZE {
                let r = tensor[[0, 0, y, x]];
                let g = tensor[[0, 1, y, x]];
                let b = tensor[[0, 2, y, x]];
                assert_eq!(r, g);
                assert_eq!(g, b);
            }
        }
    }

    #[test]
    fn test_preprocess_short_crop_pads_black() {
        // A short crop reads missing pixels as 0 instead of panicking
        let aligned = vec![128u8; 10];
        let tensor = preprocess(&aligned);
        let val = tensor[[0, 0, ARCFACE_INPUT_SIZE - 1, ARCFACE_INPUT_SIZE - 1]];
        let expected = (0.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((val - expected).abs() < 1e-6);
    }
}
