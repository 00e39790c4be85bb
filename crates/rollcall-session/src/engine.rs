//! Inference engine: ONNX models on a dedicated OS thread, driven over a
//! persistent mpsc request channel.
//!
//! Model loading happens synchronously in `spawn_engine` (fail fast); the
//! thread then serves one frame at a time. `EngineHandle` is the async
//! side of the channel and implements [`InferenceBackend`].

use crate::stream::{BackendError, FaceObservation, FrameResult, InferenceBackend};
use rollcall_core::detector::{DetectorConfig, FaceDetector};
use rollcall_core::embedder::FaceEmbedder;
use rollcall_core::liveness::{
    check_landmark_stability, LivenessGate, LivenessResult, LivenessStatus,
};
use rollcall_core::types::{BoundingBox, Detection};
use rollcall_core::Frame;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Frame budget at the nominal 30 fps capture rate. Processing slower
/// than this makes the engine suggest skipping capture cycles.
const FRAME_BUDGET: Duration = Duration::from_millis(33);

/// IoU needed to carry a track id from the previous frame's boxes.
const TRACK_ASSOC_IOU: f32 = 0.3;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] rollcall_core::EmbedderError),
    #[error("liveness error: {0}")]
    Liveness(#[from] rollcall_core::liveness::LivenessError),
}

/// Assigns correlation keys to detections by greedy IoU association
/// against the previous frame's boxes. The keys are opaque downstream:
/// same id ⇒ same physical face across consecutive frames, best effort.
struct TrackIdAssigner {
    previous: Vec<(u64, BoundingBox)>,
    next_id: u64,
}

impl TrackIdAssigner {
    fn new() -> Self {
        Self {
            previous: Vec::new(),
            next_id: 1,
        }
    }

    fn assign(&mut self, detections: &mut [Detection]) {
        let mut claimed = vec![false; self.previous.len()];

        for det in detections.iter_mut() {
            let mut best_iou = TRACK_ASSOC_IOU;
            let mut best: Option<usize> = None;
            for (i, (_, prev_bbox)) in self.previous.iter().enumerate() {
                if claimed[i] {
                    continue;
                }
                let iou = det.bbox.iou(prev_bbox);
                if iou > best_iou {
                    best_iou = iou;
                    best = Some(i);
                }
            }

            let id = match best {
                Some(i) => {
                    claimed[i] = true;
                    self.previous[i].0
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    id
                }
            };
            det.track_id = Some(id);
        }

        self.previous = detections
            .iter()
            .filter_map(|d| d.track_id.map(|id| (id, d.bbox.clone())))
            .collect();
    }
}

/// Frames of landmark history kept per track for the no-model liveness path.
const FALLBACK_HISTORY_CAP: usize = 8;

/// Zero-model liveness from per-track landmark motion.
///
/// Used when no anti-spoofing model is configured: accumulates each
/// track's 5-point landmarks and judges eye stability once at least two
/// frames are available. Faces without a track id or landmarks stay
/// `Uncertain`.
struct FallbackLiveness {
    history: HashMap<u64, VecDeque<[(f32, f32); 5]>>,
}

impl FallbackLiveness {
    fn new() -> Self {
        Self {
            history: HashMap::new(),
        }
    }

    fn observe(&mut self, detection: &Detection) -> LivenessResult {
        let (Some(id), Some(landmarks)) = (detection.track_id, detection.landmarks) else {
            return LivenessResult {
                is_real: None,
                confidence: 0.0,
                status: LivenessStatus::Uncertain,
            };
        };

        let seq = self.history.entry(id).or_default();
        seq.push_back(landmarks);
        if seq.len() > FALLBACK_HISTORY_CAP {
            seq.pop_front();
        }
        check_landmark_stability(seq.make_contiguous(), None)
    }

    /// Drop history for tracks absent from the current frame.
    fn retain(&mut self, current: &[Detection]) {
        self.history
            .retain(|id, _| current.iter().any(|d| d.track_id == Some(*id)));
    }
}

enum EngineRequest {
    Ping {
        reply: oneshot::Sender<()>,
    },
    Process {
        frame: Frame,
        reply: oneshot::Sender<Result<FrameResult, EngineError>>,
    },
}

/// Clone-safe async handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl InferenceBackend for EngineHandle {
    async fn ready(&mut self) -> Result<bool, BackendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Ping { reply: reply_tx })
            .await
            .map_err(|_| BackendError::Fatal("engine thread exited".into()))?;
        // A slow ping means the thread is busy warming up, not dead
        match tokio::time::timeout(Duration::from_millis(500), reply_rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(BackendError::Fatal("engine thread exited".into())),
            Err(_) => Ok(false),
        }
    }

    async fn infer(&mut self, frame: Frame) -> Result<FrameResult, BackendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Process {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BackendError::Fatal("engine thread exited".into()))?;
        let result = reply_rx
            .await
            .map_err(|_| BackendError::Fatal("engine thread exited".into()))?;
        // Per-frame inference failures are retryable; only a dead channel
        // is fatal to the session.
        result.map_err(|e| BackendError::Transient(e.to_string()))
    }
}

/// Load all models and spawn the engine on a dedicated OS thread.
///
/// The anti-spoofing model is optional: without it the engine falls back
/// to per-track landmark-stability analysis, which needs a couple of
/// frames of the same face before it can decide.
pub fn spawn_engine(
    scrfd_path: &str,
    arcface_path: &str,
    fas_path: Option<&str>,
    detector_config: DetectorConfig,
) -> Result<EngineHandle, EngineError> {
    let mut detector = FaceDetector::load(scrfd_path, detector_config)?;
    tracing::info!(path = scrfd_path, "SCRFD detector loaded");

    let mut embedder = FaceEmbedder::load(arcface_path)?;
    tracing::info!(path = arcface_path, "ArcFace embedder loaded");

    let mut liveness = match fas_path {
        Some(path) => {
            let gate = LivenessGate::load(path)?;
            tracing::info!(path, "anti-spoofing gate loaded");
            Some(gate)
        }
        None => {
            tracing::warn!(
                "no anti-spoofing model configured; using landmark-stability fallback"
            );
            None
        }
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut assigner = TrackIdAssigner::new();
            let mut fallback = FallbackLiveness::new();
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Ping { reply } => {
                        let _ = reply.send(());
                    }
                    EngineRequest::Process { frame, reply } => {
                        let result = process_frame(
                            &frame,
                            &mut detector,
                            &mut embedder,
                            liveness.as_mut(),
                            &mut assigner,
                            &mut fallback,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

/// Full detect→embed→liveness pass over one frame.
///
/// Per-face embed failures are logged and leave `embedding` empty; they
/// never abort sibling faces in the same frame.
fn process_frame(
    frame: &Frame,
    detector: &mut FaceDetector,
    embedder: &mut FaceEmbedder,
    mut liveness: Option<&mut LivenessGate>,
    assigner: &mut TrackIdAssigner,
    fallback: &mut FallbackLiveness,
) -> Result<FrameResult, EngineError> {
    let started = Instant::now();

    let mut detections = detector.detect(frame)?;
    assigner.assign(&mut detections);
    fallback.retain(&detections);

    let mut faces = Vec::with_capacity(detections.len());
    for detection in detections {
        let embedding = match embedder.extract(frame, &detection) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::debug!(track_id = ?detection.track_id, error = %e, "embed failed for face");
                None
            }
        };

        let liveness_result = match liveness.as_deref_mut() {
            Some(gate) => gate.classify(frame, &detection.bbox),
            None => fallback.observe(&detection),
        };

        faces.push(FaceObservation {
            detection,
            embedding,
            liveness: liveness_result,
        });
    }

    let elapsed = started.elapsed();
    let frame_skip_hint = if elapsed > FRAME_BUDGET {
        Some((elapsed.as_millis() / FRAME_BUDGET.as_millis()) as u32)
    } else {
        None
    };

    Ok(FrameResult {
        timestamp: frame.timestamp,
        faces,
        frame_skip_hint,
    })
}
