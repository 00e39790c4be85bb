//! Per-session state and the registration API.
//!
//! A `Session` owns the tracker and cooldown engine for one live camera
//! session and runs the synchronous match→track→dedup path over accepted
//! inference results. State is explicit and session-scoped — no ambient
//! globals — so teardown is a plain `reset` and every test gets a fresh
//! instance.

use crate::attendance::AttendanceEvent;
use crate::cooldown::{CooldownEngine, ObservationOutcome};
use crate::stream::FrameResult;
use crate::tracker::Tracker;
use rollcall_core::embedder::{EmbedderError, FaceEmbedder};
use rollcall_core::gallery::Gallery;
use rollcall_core::types::{BoundingBox, Detection};
use rollcall_core::Frame;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Matches at or above this similarity lock the identity onto the track.
const IDENTITY_LOCK_SIMILARITY: f32 = 0.75;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("identity not registered: {0}")]
    UnknownIdentity(String),
    #[error(transparent)]
    Embedder(#[from] EmbedderError),
}

/// One live-session pipeline state.
pub struct Session {
    gallery: Arc<Gallery>,
    tracker: Tracker,
    cooldown: CooldownEngine,
}

impl Session {
    pub fn new(gallery: Arc<Gallery>, tracker: Tracker, cooldown: CooldownEngine) -> Self {
        Self {
            gallery,
            tracker,
            cooldown,
        }
    }

    /// Run one accepted frame result through tracking, matching and the
    /// cooldown engine, returning any emitted attendance events.
    ///
    /// Per-face failures (no embedding, no match) are local: they never
    /// abort sibling faces in the same frame.
    pub fn process(&mut self, result: &FrameResult, now: Instant) -> Vec<AttendanceEvent> {
        let detections: Vec<Detection> =
            result.faces.iter().map(|f| f.detection.clone()).collect();
        self.tracker.observe(&detections, now);

        let mut events = Vec::new();

        for face in &result.faces {
            if let Some(id) = face.detection.track_id {
                self.tracker.set_liveness(id, face.liveness.status);
            }

            let Some(embedding) = &face.embedding else {
                tracing::debug!(track_id = ?face.detection.track_id, "face without embedding, skipped");
                continue;
            };

            let Some(m) = self.gallery.best_match(embedding) else {
                continue;
            };

            if let Some(id) = face.detection.track_id {
                self.tracker
                    .assign_identity(id, &m.identity, m.similarity >= IDENTITY_LOCK_SIMILARITY);
            }

            let outcome = self.cooldown.observe(
                &m.identity,
                m.similarity,
                face.liveness.status,
                Some(face.detection.bbox.clone()),
                now,
            );
            if let ObservationOutcome::Emitted(event) = outcome {
                events.push(event);
            }
        }

        events
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn cooldown(&self) -> &CooldownEngine {
        &self.cooldown
    }

    /// Session teardown: drop all track and cooldown state. Cooldown
    /// windows intentionally do not survive a restart.
    pub fn reset(&mut self) {
        self.tracker.clear();
        self.cooldown.clear();
    }
}

/// Everything needed to register an identity from one still observation.
pub struct RegistrationContext {
    pub frame: Frame,
    pub bbox: BoundingBox,
    pub landmarks: [(f32, f32); 5],
}

fn validate_identity(identity: &str) -> Result<(), RegistrationError> {
    if identity.trim().is_empty() {
        return Err(RegistrationError::EmptyIdentity);
    }
    Ok(())
}

/// Gallery registration front-end: one aligner+embedder pass per call.
pub struct Registrar {
    embedder: FaceEmbedder,
    gallery: Arc<Gallery>,
}

impl Registrar {
    pub fn new(embedder: FaceEmbedder, gallery: Arc<Gallery>) -> Self {
        Self { embedder, gallery }
    }

    /// Register an identity. The gallery is written only after the whole
    /// align+embed pass succeeded — a failure leaves it untouched.
    pub fn register(
        &mut self,
        identity: &str,
        ctx: &RegistrationContext,
    ) -> Result<(), RegistrationError> {
        validate_identity(identity)?;

        let detection = Detection::new(ctx.bbox.clone(), 1.0, Some(ctx.landmarks));
        let embedding = self.embedder.extract(&ctx.frame, &detection)?;
        self.gallery.register(identity, embedding);
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> Result<(), RegistrationError> {
        validate_identity(identity)?;
        if self.gallery.remove(identity) {
            Ok(())
        } else {
            Err(RegistrationError::UnknownIdentity(identity.to_string()))
        }
    }
}
