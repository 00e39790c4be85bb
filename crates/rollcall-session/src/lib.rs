//! rollcall-session — Session-scoped attendance pipeline state.
//!
//! Short-term face tracking, the cooldown/dedup engine that turns noisy
//! per-frame observations into a clean attendance log, and the async
//! stream controller that keeps the pipeline correct over an unreliable
//! inference channel.

pub mod attendance;
pub mod config;
pub mod cooldown;
pub mod engine;
pub mod session;
pub mod stream;
pub mod tracker;

pub use attendance::{late_label, AttendanceEvent, LateLabel};
pub use config::Config;
pub use cooldown::{CooldownEngine, CooldownRecord, ObservationOutcome};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use session::{Registrar, RegistrationContext, RegistrationError, Session};
pub use stream::{
    BackendError, FaceObservation, FrameResult, FrameSource, InferenceBackend, StreamConfig,
    StreamController, StreamError,
};
pub use tracker::{Track, Tracker};
