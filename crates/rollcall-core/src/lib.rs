//! rollcall-core — Face recognition pipeline leaves.
//!
//! SCRFD face detection, canonical alignment, ArcFace embedding extraction,
//! identity gallery matching and anti-spoofing, all running via ONNX
//! Runtime for CPU inference. Session state, tracking and attendance
//! policy live in `rollcall-session`.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod frame;
pub mod gallery;
pub mod liveness;
pub mod types;

pub use detector::{DetectorConfig, DetectorError, FaceDetector};
pub use embedder::{EmbedderError, FaceEmbedder};
pub use frame::Frame;
pub use gallery::{Gallery, GalleryMatch};
pub use liveness::{LivenessGate, LivenessResult, LivenessStatus, NonLoggingSet};
pub use types::{BoundingBox, Detection, Embedding};
