//! SCRFD face detector via ONNX Runtime.
//!
//! Implements 3-stride anchor-free decoding with class-agnostic NMS
//! post-processing, mapping results back to original frame coordinates
//! through the inverse letterbox transform.

use crate::frame::Frame;
use crate::types::{BoundingBox, Detection};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Decode-time tunables.
///
/// `scores_are_logits` is an explicit per-model flag: some SCRFD exports
/// emit raw logits that need a sigmoid, others bake the activation into
/// the graph. The convention is never inferred from the output range.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Keep anchors with probability ≥ this. Typical range 0.3–0.65.
    pub confidence_threshold: f32,
    /// Suppress boxes with IoU above this against a higher-scored survivor.
    pub iou_threshold: f32,
    /// Apply sigmoid to raw scores before thresholding.
    pub scores_are_logits: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
            scores_are_logits: false,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

/// Compute the aspect-preserving scale and padding that fit a
/// `frame_w × frame_h` image into a `input_w × input_h` canvas.
pub fn letterbox_info(input_w: usize, input_h: usize, frame_w: usize, frame_h: usize) -> LetterboxInfo {
    let scale_w = input_w as f32 / frame_w as f32;
    let scale_h = input_h as f32 / frame_h as f32;
    let scale = scale_w.min(scale_h);

    let new_w = (frame_w as f32 * scale).round();
    let new_h = (frame_h as f32 * scale).round();

    LetterboxInfo {
        scale,
        pad_x: (input_w as f32 - new_w) / 2.0,
        pad_y: (input_h as f32 - new_h) / 2.0,
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Anchor center cache keyed by (grid_h, grid_w, stride).
///
/// Centers are laid out row-major, repeated `anchors_per_cell` times per
/// cell, matching the flattened score/bbox tensor ordering.
#[derive(Default)]
pub struct AnchorCache {
    centers: HashMap<(usize, usize, usize), Vec<(f32, f32)>>,
}

impl AnchorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor centers for one stride level, generated on first use.
    pub fn centers(&mut self, grid_h: usize, grid_w: usize, stride: usize) -> &[(f32, f32)] {
        self.centers.entry((grid_h, grid_w, stride)).or_insert_with(|| {
            let mut out = Vec::with_capacity(grid_h * grid_w * SCRFD_ANCHORS_PER_CELL);
            for cy in 0..grid_h {
                for cx in 0..grid_w {
                    let center = (cx as f32 * stride as f32, cy as f32 * stride as f32);
                    for _ in 0..SCRFD_ANCHORS_PER_CELL {
                        out.push(center);
                    }
                }
            }
            out
        })
    }
}

/// Decode one distance component: `center ∓ distance * stride`.
/// Non-finite distances decode as zero offset.
fn decode_offset(center: f32, distance: f32, stride: f32, sign: f32) -> f32 {
    let d = if distance.is_finite() { distance } else { 0.0 };
    center + sign * d * stride
}

/// Decode detections for a single stride level into original-frame
/// coordinates, clamped to frame bounds.
#[allow(clippy::too_many_arguments)]
pub fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: Option<&[f32]>,
    anchors: &[(f32, f32)],
    stride: usize,
    letterbox: &LetterboxInfo,
    frame_w: f32,
    frame_h: f32,
    config: &DetectorConfig,
) -> Vec<Detection> {
    let stride_f = stride as f32;
    let mut detections = Vec::new();

    let unmap_x = |x: f32| ((x - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_w);
    let unmap_y = |y: f32| ((y - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_h);

    for (idx, &(anchor_cx, anchor_cy)) in anchors.iter().enumerate() {
        let raw = scores.get(idx).copied().unwrap_or(0.0);
        let prob = if config.scores_are_logits { sigmoid(raw) } else { raw };
        if !prob.is_finite() || prob < config.confidence_threshold {
            continue;
        }

        // Decode bbox: [left, top, right, bottom] distances * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = unmap_x(decode_offset(anchor_cx, bboxes[bbox_off], stride_f, -1.0));
        let y1 = unmap_y(decode_offset(anchor_cy, bboxes[bbox_off + 1], stride_f, -1.0));
        let x2 = unmap_x(decode_offset(anchor_cx, bboxes[bbox_off + 2], stride_f, 1.0));
        let y2 = unmap_y(decode_offset(anchor_cy, bboxes[bbox_off + 3], stride_f, 1.0));

        // Decode landmarks when the model provides them
        let kps_off = idx * 10;
        let landmarks = kps.and_then(|k| {
            if kps_off + 9 < k.len() {
                let mut lms = [(0.0f32, 0.0f32); 5];
                for (i, lm) in lms.iter_mut().enumerate() {
                    let lx = decode_offset(anchor_cx, k[kps_off + i * 2], stride_f, 1.0);
                    let ly = decode_offset(anchor_cy, k[kps_off + i * 2 + 1], stride_f, 1.0);
                    *lm = (unmap_x(lx), unmap_y(ly));
                }
                Some(lms)
            } else {
                None
            }
        });

        detections.push(Detection::new(
            BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            prob,
            landmarks,
        ));
    }

    detections
}

/// Class-agnostic Non-Maximum Suppression.
///
/// Sorts by score descending and suppresses any box with IoU above the
/// threshold against a higher-scored survivor. No secondary tie-break.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, Option<usize>);

/// SCRFD-based face detector.
///
/// Pure function of (frame, weights): no side effects beyond the anchor
/// cache, and malformed frames return an empty result rather than an error.
pub struct FaceDetector {
    session: Session,
    config: DetectorConfig,
    input_height: usize,
    input_width: usize,
    anchors: AnchorCache,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            scores_are_logits = config.scores_are_logits,
            "loaded SCRFD model"
        );

        // 9 outputs = score/bbox/kps per stride; 6 = score/bbox only.
        if num_outputs != 9 && num_outputs != 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 6 or 9 outputs (3 strides × score/bbox[/kps]), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names, num_outputs == 9);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            config,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            anchors: AnchorCache::new(),
            stride_indices,
        })
    }

    /// Detect faces in a grayscale frame, returning detections sorted by
    /// confidence. A malformed or zero-sized frame yields an empty set.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        if !frame.is_well_formed() {
            tracing::debug!(
                width = frame.width,
                height = frame.height,
                len = frame.data.len(),
                "skipping malformed frame"
            );
            return Ok(Vec::new());
        }

        let letterbox = letterbox_info(
            self.input_width,
            self.input_height,
            frame.width as usize,
            frame.height as usize,
        );
        let input = preprocess(
            &frame.data,
            frame.width as usize,
            frame.height as usize,
            self.input_width,
            self.input_height,
            &letterbox,
        );

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let kps = match kps_idx {
                Some(idx) => Some(
                    outputs[idx]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| {
                            DetectorError::InferenceFailed(format!("kps stride {stride}: {e}"))
                        })?
                        .1,
                ),
                None => None,
            };

            let grid_h = self.input_height / stride;
            let grid_w = self.input_width / stride;
            let anchors = self.anchors.centers(grid_h, grid_w, stride);

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                anchors,
                stride,
                &letterbox,
                frame.width as f32,
                frame.height as f32,
                &self.config,
            ));
        }

        Ok(nms(all_detections, self.config.iou_threshold))
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...)
/// or generic numeric names. If the named pattern is detected, maps them to
/// stride slots; otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32, when present)
fn discover_output_indices(names: &[String], has_kps: bool) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = SCRFD_STRIDES.iter().all(|&stride| {
        find("score", stride).is_some()
            && find("bbox", stride).is_some()
            && (!has_kps || find("kps", stride).is_some())
    });

    if named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            (
                find("score", stride).unwrap(),
                find("bbox", stride).unwrap(),
                if has_kps { find("kps", stride) } else { None },
            )
        })
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping"
        );
        if has_kps {
            [(0, 3, Some(6)), (1, 4, Some(7)), (2, 5, Some(8))]
        } else {
            [(0, 3, None), (1, 4, None), (2, 5, None)]
        }
    }
}

/// Preprocess a grayscale frame into a NCHW float tensor with letterbox padding.
///
/// Resizes with bilinear interpolation, then normalizes to the SCRFD input
/// distribution. Padding uses the mean value so it normalizes to 0.0.
fn preprocess(
    frame: &[u8],
    width: usize,
    height: usize,
    input_w: usize,
    input_h: usize,
    letterbox: &LetterboxInfo,
) -> Array4<f32> {
    let new_w = (width as f32 * letterbox.scale).round() as usize;
    let new_h = (height as f32 * letterbox.scale).round() as usize;

    let inv_scale = 1.0 / letterbox.scale;
    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, input_h, input_w));

    for y in 0..input_h {
        for x in 0..input_w {
            let pixel = if y >= pad_y_start
                && y < pad_y_start + new_h
                && x >= pad_x_start
                && x < pad_x_start + new_w
            {
                resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
            } else {
                SCRFD_MEAN // pad value normalizes to 0.0
            };

            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    tensor
}
