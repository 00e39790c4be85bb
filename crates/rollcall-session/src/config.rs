//! Session configuration, loaded from `ROLLCALL_*` environment variables.

use chrono::NaiveTime;
use rollcall_core::detector::DetectorConfig;
use rollcall_core::liveness::{LivenessStatus, NonLoggingSet};
use std::path::PathBuf;
use std::time::Duration;

pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Dot-product similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Detector confidence threshold (typical 0.3–0.65).
    pub detect_confidence: f32,
    /// Detector NMS IoU threshold.
    pub detect_iou: f32,
    /// Whether the detection model emits raw logits needing a sigmoid.
    pub detect_scores_are_logits: bool,
    /// Per-identity attendance cooldown. Zero disables deduplication.
    pub cooldown: Duration,
    /// Liveness statuses that suppress attendance logging.
    pub non_logging_statuses: NonLoggingSet,
    /// Scheduled session start, consumed only at report time.
    pub scheduled_start: Option<NaiveTime>,
    /// Grace period added to the scheduled start before a check-in is late.
    pub late_grace_minutes: u32,
    /// Source label stamped onto emitted attendance events.
    pub source_label: String,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        Self {
            model_dir,
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", 0.60),
            detect_confidence: env_f32("ROLLCALL_DETECT_CONFIDENCE", 0.5),
            detect_iou: env_f32("ROLLCALL_DETECT_IOU", 0.4),
            detect_scores_are_logits: std::env::var("ROLLCALL_DETECT_SCORES_ARE_LOGITS")
                .map(|v| v == "1")
                .unwrap_or(false),
            cooldown: Duration::from_secs(env_u64("ROLLCALL_COOLDOWN_SECS", 300)),
            non_logging_statuses: std::env::var("ROLLCALL_NON_LOGGING_STATUSES")
                .ok()
                .map(|v| parse_statuses(&v))
                .unwrap_or_default(),
            scheduled_start: std::env::var("ROLLCALL_SCHEDULED_START")
                .ok()
                .and_then(|v| parse_start_time(&v)),
            late_grace_minutes: env_u64("ROLLCALL_LATE_GRACE_MINUTES", 10) as u32,
            source_label: std::env::var("ROLLCALL_SOURCE_LABEL")
                .unwrap_or_else(|_| "camera-0".to_string()),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            confidence_threshold: self.detect_confidence,
            iou_threshold: self.detect_iou,
            scores_are_logits: self.detect_scores_are_logits,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the anti-spoofing model, if installed.
    pub fn fas_model_path(&self) -> Option<String> {
        let path = self.model_dir.join("minifasnet_v2.onnx");
        path.exists()
            .then(|| path.to_string_lossy().into_owned())
    }
}

fn default_model_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/share/rollcall/models")
}

/// Parse a comma-separated liveness status list; unknown names are
/// skipped with a warning rather than failing startup.
fn parse_statuses(csv: &str) -> NonLoggingSet {
    let statuses: Vec<LivenessStatus> = csv
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match s.parse() {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unknown liveness status in config");
                None
            }
        })
        .collect();
    NonLoggingSet::new(statuses)
}

fn parse_start_time(s: &str) -> Option<NaiveTime> {
    match NaiveTime::parse_from_str(s.trim(), "%H:%M") {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(value = s, error = %e, "invalid ROLLCALL_SCHEDULED_START, ignoring");
            None
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
