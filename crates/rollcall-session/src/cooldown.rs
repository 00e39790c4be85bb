//! Cooldown / dedup engine.
//!
//! Turns a noisy per-frame observation stream into deduplicated
//! `AttendanceEvent`s: per identity, at most one event per cooldown
//! window. Records are session-scoped and cleared on teardown; cooldown
//! state does not survive a session restart.

use crate::attendance::AttendanceEvent;
use chrono::Utc;
use rollcall_core::liveness::{LivenessStatus, NonLoggingSet};
use rollcall_core::types::BoundingBox;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Active suppression window for one identity.
///
/// `window_duration` is captured when the window opens and is immutable
/// for the window's lifetime; configuration changes apply only to windows
/// opened afterwards.
#[derive(Debug, Clone)]
pub struct CooldownRecord {
    pub window_start: Instant,
    pub window_duration: Duration,
    /// Refreshed on suppressed observations for UI feedback.
    pub last_bbox: Option<BoundingBox>,
}

/// What the engine did with one observation.
#[derive(Debug)]
pub enum ObservationOutcome {
    Emitted(AttendanceEvent),
    SuppressedByLiveness(LivenessStatus),
    SuppressedByCooldown { remaining: Duration },
}

impl ObservationOutcome {
    pub fn into_event(self) -> Option<AttendanceEvent> {
        match self {
            Self::Emitted(ev) => Some(ev),
            _ => None,
        }
    }
}

/// Per-session cooldown/dedup state machine. Single-writer: the map is
/// keyed by identity and only touched from the session's synchronous
/// processing path, so per-identity events are strictly time-increasing.
pub struct CooldownEngine {
    records: HashMap<String, CooldownRecord>,
    cooldown: Duration,
    non_logging: NonLoggingSet,
    source: String,
}

impl CooldownEngine {
    pub fn new(cooldown: Duration, non_logging: NonLoggingSet, source: &str) -> Self {
        Self {
            records: HashMap::new(),
            cooldown,
            non_logging,
            source: source.to_string(),
        }
    }

    /// Change the cooldown length for future windows. Windows already
    /// open keep the duration captured at creation.
    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// Process one recognized observation.
    ///
    /// Precondition: recognition succeeded and similarity passed the
    /// matcher threshold; this engine only gates on liveness and time.
    pub fn observe(
        &mut self,
        identity: &str,
        confidence: f32,
        liveness: LivenessStatus,
        bbox: Option<BoundingBox>,
        now: Instant,
    ) -> ObservationOutcome {
        if self.non_logging.suppresses(liveness) {
            // Keep the bbox fresh for UI feedback even while suppressed
            if let Some(record) = self.records.get_mut(identity) {
                if bbox.is_some() {
                    record.last_bbox = bbox;
                }
            }
            tracing::debug!(identity, ?liveness, "observation suppressed by liveness");
            return ObservationOutcome::SuppressedByLiveness(liveness);
        }

        if let Some(record) = self.records.get_mut(identity) {
            let elapsed = now.saturating_duration_since(record.window_start);
            if elapsed < record.window_duration {
                if bbox.is_some() {
                    record.last_bbox = bbox;
                }
                let remaining = record.window_duration - elapsed;
                tracing::debug!(identity, ?remaining, "observation suppressed by cooldown");
                return ObservationOutcome::SuppressedByCooldown { remaining };
            }
        }

        // Emit and open a new window with the currently configured length
        let event = AttendanceEvent {
            identity: identity.to_string(),
            timestamp: Utc::now(),
            confidence,
            liveness,
            source: self.source.clone(),
        };
        self.records.insert(
            identity.to_string(),
            CooldownRecord {
                window_start: now,
                window_duration: self.cooldown,
                last_bbox: bbox,
            },
        );
        tracing::info!(
            identity,
            confidence,
            ?liveness,
            cooldown_secs = self.cooldown.as_secs(),
            "attendance event emitted"
        );
        ObservationOutcome::Emitted(event)
    }

    /// Whether an identity currently sits inside an active window.
    pub fn in_cooldown(&self, identity: &str, now: Instant) -> bool {
        self.records
            .get(identity)
            .map(|r| now.saturating_duration_since(r.window_start) < r.window_duration)
            .unwrap_or(false)
    }

    pub fn record(&self, identity: &str) -> Option<&CooldownRecord> {
        self.records.get(identity)
    }

    /// Drop all windows (session teardown).
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
