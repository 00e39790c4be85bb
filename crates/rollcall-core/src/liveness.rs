//! Anti-spoofing liveness gate.
//!
//! Primary path: a MiniFASNet-style ONNX classifier over an 80×80 face
//! region crop. Supplemental zero-model path: landmark stability analysis —
//! a printed photo produces near-identical landmark positions across
//! consecutive frames, while a live person exhibits involuntary eye drift.
//!
//! The gate never propagates an error across its boundary for bad input:
//! inference failure is reported as `LivenessStatus::Error` in the result.

use crate::frame::Frame;
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const FAS_INPUT_SIZE: usize = 80;
/// Face regions smaller than this on either side carry too little texture
/// for a meaningful spoof decision.
const FAS_MIN_REGION: f32 = 32.0;
const FAS_REAL_THRESHOLD: f32 = 0.7;
const FAS_FAKE_THRESHOLD: f32 = 0.7;

/// Minimum mean eye displacement (pixels) below which consecutive frames
/// are considered suspiciously static. Even a steady gaze produces >1 px
/// of involuntary movement between frames at 30 fps on a 640×480 sensor;
/// a printed photo produces <0.3 px (sensor noise only).
const DEFAULT_MIN_EYE_DISPLACEMENT: f32 = 0.8;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Real,
    Fake,
    Uncertain,
    /// Inference failed; suppresses logging but is not an active spoof signal.
    Error,
    InsufficientQuality,
}

impl std::str::FromStr for LivenessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "real" => Ok(Self::Real),
            "fake" => Ok(Self::Fake),
            "uncertain" => Ok(Self::Uncertain),
            "error" => Ok(Self::Error),
            "insufficient_quality" => Ok(Self::InsufficientQuality),
            other => Err(format!("unknown liveness status: {other}")),
        }
    }
}

/// Result of a liveness check on one face region.
#[derive(Debug, Clone)]
pub struct LivenessResult {
    /// `Some(true)` = live, `Some(false)` = spoof, `None` = undetermined.
    pub is_real: Option<bool>,
    pub confidence: f32,
    pub status: LivenessStatus,
}

impl LivenessResult {
    fn undetermined(status: LivenessStatus) -> Self {
        Self { is_real: None, confidence: 0.0, status }
    }
}

/// Statuses that suppress attendance logging even on a successful match.
///
/// `Error` always suppresses regardless of membership, but it is never
/// treated as an active spoof signal.
#[derive(Debug, Clone)]
pub struct NonLoggingSet {
    statuses: Vec<LivenessStatus>,
}

impl NonLoggingSet {
    pub fn new(statuses: Vec<LivenessStatus>) -> Self {
        Self { statuses }
    }

    /// Whether an attendance event for this status must be suppressed.
    pub fn suppresses(&self, status: LivenessStatus) -> bool {
        status == LivenessStatus::Error || self.statuses.contains(&status)
    }
}

impl Default for NonLoggingSet {
    fn default() -> Self {
        Self::new(vec![
            LivenessStatus::Fake,
            LivenessStatus::Uncertain,
            LivenessStatus::InsufficientQuality,
        ])
    }
}

/// Map classifier probabilities onto a gate decision.
///
/// `real_prob` is the softmax probability of the "real" class.
fn classify_probs(real_prob: f32) -> LivenessResult {
    if !real_prob.is_finite() {
        return LivenessResult::undetermined(LivenessStatus::Error);
    }
    if real_prob >= FAS_REAL_THRESHOLD {
        LivenessResult {
            is_real: Some(true),
            confidence: real_prob,
            status: LivenessStatus::Real,
        }
    } else if (1.0 - real_prob) >= FAS_FAKE_THRESHOLD {
        LivenessResult {
            is_real: Some(false),
            confidence: 1.0 - real_prob,
            status: LivenessStatus::Fake,
        }
    } else {
        LivenessResult {
            is_real: None,
            confidence: real_prob,
            status: LivenessStatus::Uncertain,
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![0.0; logits.len()]
    }
}

/// MiniFASNet-style anti-spoofing classifier.
pub struct LivenessGate {
    session: Session,
}

impl LivenessGate {
    pub fn load(model_path: &str) -> Result<Self, LivenessError> {
        if !Path::new(model_path).exists() {
            return Err(LivenessError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded anti-spoofing model");

        Ok(Self { session })
    }

    /// Classify a face region as real or spoofed.
    ///
    /// The region need not be the canonical aligned crop; the raw
    /// detection bbox is fine. Never returns an error for bad input —
    /// failures surface as `LivenessStatus::Error` in the result.
    pub fn classify(&mut self, frame: &Frame, bbox: &BoundingBox) -> LivenessResult {
        if !frame.is_well_formed() {
            return LivenessResult::undetermined(LivenessStatus::InsufficientQuality);
        }
        if bbox.width < FAS_MIN_REGION || bbox.height < FAS_MIN_REGION {
            return LivenessResult::undetermined(LivenessStatus::InsufficientQuality);
        }

        let input = crop_resize(frame, bbox, FAS_INPUT_SIZE);

        match self.run_inference(&input) {
            Ok(real_prob) => classify_probs(real_prob),
            Err(e) => {
                tracing::warn!(error = %e, "liveness inference failed");
                LivenessResult::undetermined(LivenessStatus::Error)
            }
        }
    }

    fn run_inference(&mut self, input: &Array4<f32>) -> Result<f32, LivenessError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0].try_extract_tensor::<f32>()?;

        // 2-class {fake, real} or 3-class {fake-2d, real, fake-3d}
        // exports both put "real" at index 1.
        let probs = softmax(logits);
        Ok(probs.get(1).copied().unwrap_or(f32::NAN))
    }
}

/// Crop a face region and resize to a square NCHW tensor, normalized to
/// [0, 1]. Bilinear sampling; out-of-frame pixels read as black.
fn crop_resize(frame: &Frame, bbox: &BoundingBox, out_size: usize) -> Array4<f32> {
    let w = frame.width as i32;
    let h = frame.height as i32;
    let mut tensor = Array4::<f32>::zeros((1, 3, out_size, out_size));

    let sample = |x: i32, y: i32| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            frame.data[y as usize * w as usize + x as usize] as f32
        } else {
            0.0
        }
    };

    for oy in 0..out_size {
        let sy = bbox.y + (oy as f32 + 0.5) / out_size as f32 * bbox.height - 0.5;
        let y0 = sy.floor() as i32;
        let fy = sy - y0 as f32;
        for ox in 0..out_size {
            let sx = bbox.x + (ox as f32 + 0.5) / out_size as f32 * bbox.width - 0.5;
            let x0 = sx.floor() as i32;
            let fx = sx - x0 as f32;

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            let normalized = val / 255.0;
            tensor[[0, 0, oy, ox]] = normalized;
            tensor[[0, 1, oy, ox]] = normalized;
            tensor[[0, 2, oy, ox]] = normalized;
        }
    }

    tensor
}

/// Zero-model liveness check from landmark stability.
///
/// Each entry in `landmark_sequence` is the 5-point landmark array for one
/// frame; indices 0 and 1 are the eye centres. Static eye landmarks across
/// consecutive frames indicate a printed photo. Fewer than two frames
/// cannot be judged and yield `Uncertain`.
pub fn check_landmark_stability(
    landmark_sequence: &[[(f32, f32); 5]],
    min_displacement: Option<f32>,
) -> LivenessResult {
    let threshold = min_displacement.unwrap_or(DEFAULT_MIN_EYE_DISPLACEMENT);

    if landmark_sequence.len() < 2 {
        return LivenessResult::undetermined(LivenessStatus::Uncertain);
    }

    let mut total_displacement = 0.0f32;
    let mut pair_count = 0usize;

    for pair in landmark_sequence.windows(2) {
        let prev = &pair[0];
        let curr = &pair[1];

        for eye in 0..2 {
            let dx = curr[eye].0 - prev[eye].0;
            let dy = curr[eye].1 - prev[eye].1;
            total_displacement += (dx * dx + dy * dy).sqrt();
        }
        pair_count += 1;
    }

    let mean = total_displacement / (pair_count as f32 * 2.0);
    if mean >= threshold {
        LivenessResult {
            is_real: Some(true),
            confidence: (mean / (threshold * 2.0)).min(1.0),
            status: LivenessStatus::Real,
        }
    } else {
        LivenessResult {
            is_real: Some(false),
            confidence: 1.0 - (mean / threshold).min(1.0),
            status: LivenessStatus::Fake,
        }
    }
}
