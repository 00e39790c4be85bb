//! Short-term multi-face tracking.
//!
//! Tracks are keyed by the upstream detector's opaque `track_id` and hold a
//! bounded bbox history used to score positional stability. The tracker
//! never re-associates detections itself: same id ⇒ same physical face is
//! a best-effort guarantee owned upstream.

use rollcall_core::liveness::LivenessStatus;
use rollcall_core::types::{BoundingBox, Detection};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Bbox history ring capacity per track.
const HISTORY_CAP: usize = 16;
/// Frames a track may go un-refreshed before eviction.
const DEFAULT_MAX_OCCLUSION: u32 = 30;
/// History samples required before jitter is scored; below this the
/// consistency score stays neutral.
const MIN_CONSISTENCY_SAMPLES: usize = 3;

/// One tracked face. Session-scoped; ids are never persisted.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    history: VecDeque<BoundingBox>,
    pub last_seen: Instant,
    pub max_confidence: f32,
    /// Identity lock: once a confident match sticks, later weaker
    /// matches do not overwrite it.
    pub locked: bool,
    pub identity: Option<String>,
    pub occlusion_count: u32,
    /// 0..1 jitter-quality proxy from recent bbox center/size variance.
    pub angle_consistency: f32,
    pub liveness: LivenessStatus,
}

impl Track {
    fn new(id: u64, bbox: BoundingBox, confidence: f32, now: Instant) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_CAP);
        history.push_back(bbox);
        Self {
            id,
            history,
            last_seen: now,
            max_confidence: confidence,
            locked: false,
            identity: None,
            occlusion_count: 0,
            angle_consistency: 1.0,
            liveness: LivenessStatus::Uncertain,
        }
    }

    fn refresh(&mut self, bbox: BoundingBox, confidence: f32, now: Instant) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(bbox);
        self.last_seen = now;
        self.max_confidence = self.max_confidence.max(confidence);
        self.occlusion_count = 0;
        self.angle_consistency = angle_consistency(&self.history);
    }

    pub fn last_bbox(&self) -> &BoundingBox {
        self.history.back().expect("track history never empty")
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Score positional stability of a bbox history in [0, 1].
///
/// High center or size variance relative to box scale means the head is
/// jittering or the detector is unstable; 1.0 means rock steady.
fn angle_consistency(history: &VecDeque<BoundingBox>) -> f32 {
    let n = history.len();
    if n < MIN_CONSISTENCY_SAMPLES {
        return 1.0;
    }

    let nf = n as f32;
    let mut mean_cx = 0.0f32;
    let mut mean_cy = 0.0f32;
    let mut mean_diag = 0.0f32;
    for b in history {
        let (cx, cy) = b.center();
        mean_cx += cx;
        mean_cy += cy;
        mean_diag += (b.width * b.width + b.height * b.height).sqrt();
    }
    mean_cx /= nf;
    mean_cy /= nf;
    mean_diag /= nf;

    if mean_diag <= f32::EPSILON {
        return 0.0;
    }

    let mut var_center = 0.0f32;
    let mut var_diag = 0.0f32;
    for b in history {
        let (cx, cy) = b.center();
        var_center += (cx - mean_cx).powi(2) + (cy - mean_cy).powi(2);
        let diag = (b.width * b.width + b.height * b.height).sqrt();
        var_diag += (diag - mean_diag).powi(2);
    }
    let center_jitter = (var_center / nf).sqrt() / mean_diag;
    let size_jitter = (var_diag / nf).sqrt() / mean_diag;

    (1.0 - 2.0 * (center_jitter + size_jitter)).clamp(0.0, 1.0)
}

/// Per-session track table.
pub struct Tracker {
    tracks: HashMap<u64, Track>,
    max_occlusion: u32,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OCCLUSION)
    }
}

impl Tracker {
    pub fn new(max_occlusion: u32) -> Self {
        Self {
            tracks: HashMap::new(),
            max_occlusion,
        }
    }

    /// Ingest one frame's detections.
    ///
    /// Detections carrying a `track_id` refresh the matching track or
    /// create it; detections without an id are ignored here (they still
    /// flow through matching, but carry no cross-frame state). Tracks not
    /// refreshed this frame age by one occlusion step and are evicted
    /// past the bound.
    pub fn observe(&mut self, detections: &[Detection], now: Instant) {
        let mut refreshed: Vec<u64> = Vec::with_capacity(detections.len());

        for det in detections {
            let Some(id) = det.track_id else { continue };
            refreshed.push(id);
            match self.tracks.get_mut(&id) {
                Some(track) => track.refresh(det.bbox.clone(), det.confidence, now),
                None => {
                    tracing::debug!(track_id = id, "new track");
                    self.tracks
                        .insert(id, Track::new(id, det.bbox.clone(), det.confidence, now));
                }
            }
        }

        // Housekeeping: age and evict occluded tracks
        let max = self.max_occlusion;
        self.tracks.retain(|id, track| {
            if refreshed.contains(id) {
                return true;
            }
            track.occlusion_count += 1;
            if track.occlusion_count > max {
                tracing::debug!(track_id = id, "track evicted after sustained occlusion");
                false
            } else {
                true
            }
        });
    }

    /// Record the latest liveness decision on a track.
    pub fn set_liveness(&mut self, id: u64, status: LivenessStatus) {
        if let Some(track) = self.tracks.get_mut(&id) {
            track.liveness = status;
        }
    }

    /// Assign an identity to a track. Once `lock` has been set, later
    /// assignments are ignored.
    pub fn assign_identity(&mut self, id: u64, identity: &str, lock: bool) {
        if let Some(track) = self.tracks.get_mut(&id) {
            if track.locked {
                return;
            }
            track.identity = Some(identity.to_string());
            track.locked = lock;
        }
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop all tracks (session teardown).
    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(id: u64, x: f32, y: f32, size: f32, conf: f32) -> Detection {
        let mut d = Detection::new(
            BoundingBox { x, y, width: size, height: size },
            conf,
            None,
        );
        d.track_id = Some(id);
        d
    }

    #[test]
    fn test_track_created_on_first_detection() {
        let mut tracker = Tracker::default();
        tracker.observe(&[det(7, 10.0, 10.0, 50.0, 0.9)], Instant::now());
        assert_eq!(tracker.len(), 1);
        let t = tracker.get(7).unwrap();
        assert_eq!(t.occlusion_count, 0);
        assert!((t.max_confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_refresh_resets_occlusion_and_keeps_max_confidence() {
        let mut tracker = Tracker::default();
        let now = Instant::now();
        tracker.observe(&[det(1, 10.0, 10.0, 50.0, 0.9)], now);
        tracker.observe(&[], now); // occlusion +1
        assert_eq!(tracker.get(1).unwrap().occlusion_count, 1);

        tracker.observe(&[det(1, 11.0, 10.0, 50.0, 0.5)], now);
        let t = tracker.get(1).unwrap();
        assert_eq!(t.occlusion_count, 0);
        // Max confidence is sticky
        assert!((t.max_confidence - 0.9).abs() < 1e-6);
        assert_eq!(t.history_len(), 2);
    }

    #[test]
    fn test_eviction_after_sustained_occlusion() {
        let mut tracker = Tracker::new(3);
        let now = Instant::now();
        tracker.observe(&[det(1, 10.0, 10.0, 50.0, 0.9)], now);
        for _ in 0..3 {
            tracker.observe(&[], now);
        }
        assert_eq!(tracker.len(), 1);
        tracker.observe(&[], now); // 4th miss exceeds the bound
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_history_bounded() {
        let mut tracker = Tracker::default();
        let now = Instant::now();
        for i in 0..40 {
            tracker.observe(&[det(1, i as f32, 10.0, 50.0, 0.9)], now);
        }
        assert_eq!(tracker.get(1).unwrap().history_len(), HISTORY_CAP);
    }

    #[test]
    fn test_detection_without_track_id_ignored() {
        let mut tracker = Tracker::default();
        let d = Detection::new(
            BoundingBox { x: 0.0, y: 0.0, width: 50.0, height: 50.0 },
            0.9,
            None,
        );
        tracker.observe(&[d], Instant::now());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_angle_consistency_stable_vs_jittery() {
        let mut stable = Tracker::default();
        let mut jittery = Tracker::default();
        let now = Instant::now();
        for i in 0..10 {
            stable.observe(&[det(1, 100.0, 100.0, 80.0, 0.9)], now);
            // center and size bounce around wildly
            let off = if i % 2 == 0 { 0.0 } else { 40.0 };
            jittery.observe(&[det(1, 100.0 + off, 100.0 - off, 80.0 + off, 0.9)], now);
        }
        let s = stable.get(1).unwrap().angle_consistency;
        let j = jittery.get(1).unwrap().angle_consistency;
        assert!((s - 1.0).abs() < 1e-3, "stable = {s}");
        assert!(j < s, "jittery {j} should score below stable {s}");
    }

    #[test]
    fn test_identity_lock() {
        let mut tracker = Tracker::default();
        tracker.observe(&[det(1, 10.0, 10.0, 50.0, 0.9)], Instant::now());
        tracker.assign_identity(1, "alice", true);
        tracker.assign_identity(1, "mallory", true);
        assert_eq!(tracker.get(1).unwrap().identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_clear() {
        let mut tracker = Tracker::default();
        tracker.observe(&[det(1, 10.0, 10.0, 50.0, 0.9)], Instant::now());
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
