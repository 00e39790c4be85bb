//! Attendance events and report-time late labeling.

use chrono::{DateTime, NaiveTime, Utc};
use rollcall_core::liveness::LivenessStatus;
use serde::{Deserialize, Serialize};

/// One attendance check-in. Append-only: immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub liveness: LivenessStatus,
    /// Where the observation came from, e.g. a camera label.
    pub source: String,
}

/// Late determination, recomputed from raw timestamps at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateLabel {
    OnTime,
    Late,
}

/// Label a check-in against a scheduled start plus grace period.
///
/// Pure function of its inputs: the stored check-in timestamp is never
/// mutated, so changing the schedule after the fact changes the displayed
/// label and nothing else. Never a gating input to event emission.
///
/// A grace window crossing midnight (e.g. 23:55 start, 10 min grace) is
/// handled: only check-ins strictly between the wrapped deadline and the
/// next scheduled start are late.
pub fn late_label(
    check_in: DateTime<Utc>,
    scheduled_start: NaiveTime,
    grace_minutes: u32,
) -> LateLabel {
    let grace = chrono::Duration::minutes(grace_minutes as i64);
    let (deadline, wrap_secs) = scheduled_start.overflowing_add_signed(grace);
    let t = check_in.time();

    let late = if wrap_secs > 0 {
        t > deadline && t < scheduled_start
    } else {
        t > deadline
    };
    if late {
        LateLabel::Late
    } else {
        LateLabel::OnTime
    }
}
