//! Stream controller: owns the capture→infer→deliver loop for one live
//! session over an unreliable async inference channel.
//!
//! The pump permits at most one outstanding in-flight frame: the next
//! frame is pulled only after the current result has been accepted or
//! rejected as stale. Dropping the run future cancels any pending
//! inference await.

use crate::attendance::AttendanceEvent;
use crate::session::Session;
use rollcall_core::liveness::LivenessResult;
use rollcall_core::types::{Detection, Embedding};
use rollcall_core::Frame;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum BackendError {
    /// Retryable: the controller backs off and resumes the loop.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// Infrastructure failure: propagates and ends the session.
    #[error("backend failure: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(
        "inference backend not ready after {0:?} — check that the ONNX models \
         are installed and the engine thread is running"
    )]
    StartupTimeout(Duration),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Everything inference produced for one face in one frame.
///
/// `embedding` is `None` when the per-face embed step failed (missing
/// landmarks, degenerate alignment); the face still feeds the tracker.
pub struct FaceObservation {
    pub detection: Detection,
    pub embedding: Option<Embedding>,
    pub liveness: LivenessResult,
}

/// Per-frame inference result delivered over the channel.
pub struct FrameResult {
    /// Capture timestamp of the source frame. Monotonically non-decreasing
    /// across results; the controller discards anything at or before the
    /// last accepted timestamp as stale.
    pub timestamp: Instant,
    pub faces: Vec<FaceObservation>,
    /// Backend suggestion: skip this many capture cycles before the next
    /// frame, honored once.
    pub frame_skip_hint: Option<u32>,
}

/// Asynchronous request/response inference channel.
///
/// Every call is an async suspension point; match/cooldown logic stays
/// synchronous on the controller side.
pub trait InferenceBackend {
    /// Readiness probe. `Ok(false)` means not yet ready — keep polling.
    fn ready(&mut self) -> impl Future<Output = Result<bool, BackendError>> + Send;
    /// Run the full detect→embed→liveness pass on one frame.
    fn infer(&mut self, frame: Frame) -> impl Future<Output = Result<FrameResult, BackendError>> + Send;
}

/// Source of capture frames for one session.
pub trait FrameSource {
    /// Next frame, skipping `skip` capture cycles first. `None` ends the
    /// session and releases capture resources.
    fn next_frame(&mut self, skip: u32) -> impl Future<Output = Option<Frame>> + Send;
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub readiness_poll_interval: Duration,
    pub readiness_timeout: Duration,
    /// Base backoff between transient-failure retries; grows linearly.
    pub retry_backoff: Duration,
    pub max_retries: u32,
    pub fps_window: usize,
    /// Minimum interval between FPS recomputations (UI churn cap).
    pub fps_update_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            readiness_poll_interval: Duration::from_millis(200),
            readiness_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(100),
            max_retries: 3,
            fps_window: 30,
            fps_update_interval: Duration::from_millis(100),
        }
    }
}

/// Rolling FPS estimate over a bounded window of arrival timestamps,
/// recomputed at a capped rate (≤10/s by default) to avoid UI churn.
pub struct FpsEstimator {
    arrivals: VecDeque<Instant>,
    capacity: usize,
    min_update_interval: Duration,
    last_update: Option<Instant>,
    current: f32,
}

impl FpsEstimator {
    pub fn new(capacity: usize, min_update_interval: Duration) -> Self {
        Self {
            arrivals: VecDeque::with_capacity(capacity),
            capacity,
            min_update_interval,
            last_update: None,
            current: 0.0,
        }
    }

    /// Record one result arrival. The published estimate only changes
    /// when the update interval has elapsed.
    pub fn record(&mut self, now: Instant) {
        if self.arrivals.len() == self.capacity {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(now);

        let due = self
            .last_update
            .map_or(true, |t| now.saturating_duration_since(t) >= self.min_update_interval);
        if due {
            self.current = self.compute();
            self.last_update = Some(now);
        }
    }

    fn compute(&self) -> f32 {
        if self.arrivals.len() < 2 {
            return 0.0;
        }
        let first = *self.arrivals.front().expect("non-empty");
        let last = *self.arrivals.back().expect("non-empty");
        let span = last.saturating_duration_since(first).as_secs_f32();
        if span > 0.0 {
            (self.arrivals.len() - 1) as f32 / span
        } else {
            0.0
        }
    }

    pub fn fps(&self) -> f32 {
        self.current
    }
}

/// Capture→infer→deliver pump for one live session.
pub struct StreamController<S, B> {
    source: S,
    backend: B,
    config: StreamConfig,
    last_accepted: Option<Instant>,
    fps: FpsEstimator,
    skip_hint: u32,
}

impl<S: FrameSource, B: InferenceBackend> StreamController<S, B> {
    pub fn new(source: S, backend: B, config: StreamConfig) -> Self {
        let fps = FpsEstimator::new(config.fps_window, config.fps_update_interval);
        Self {
            source,
            backend,
            config,
            last_accepted: None,
            fps,
            skip_hint: 0,
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps.fps()
    }

    /// Poll the backend readiness signal with bounded retries and an
    /// overall timeout. "Not yet ready" keeps polling; a fatal backend
    /// error fails immediately.
    pub async fn wait_ready(&mut self) -> Result<(), StreamError> {
        let deadline = Instant::now() + self.config.readiness_timeout;
        loop {
            match self.backend.ready().await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::debug!("backend not yet ready, polling again");
                }
                Err(e @ BackendError::Fatal(_)) => return Err(e.into()),
                Err(BackendError::Transient(msg)) => {
                    tracing::debug!(error = %msg, "readiness probe failed transiently");
                }
            }
            if Instant::now() + self.config.readiness_poll_interval >= deadline {
                return Err(StreamError::StartupTimeout(self.config.readiness_timeout));
            }
            tokio::time::sleep(self.config.readiness_poll_interval).await;
        }
    }

    /// Run the pump loop until the frame source ends or the event sink
    /// closes. Accepted results flow through the session's synchronous
    /// match/cooldown path; emitted attendance events go to `events`.
    ///
    /// On exit all per-session track and cooldown state is cleared.
    pub async fn run(
        &mut self,
        session: &mut Session,
        events: mpsc::Sender<AttendanceEvent>,
    ) -> Result<(), StreamError> {
        let result = self.pump(session, &events).await;
        // Session teardown: per-session state never outlives the stream
        session.reset();
        result
    }

    async fn pump(
        &mut self,
        session: &mut Session,
        events: &mpsc::Sender<AttendanceEvent>,
    ) -> Result<(), StreamError> {
        loop {
            let Some(frame) = self.source.next_frame(self.skip_hint).await else {
                tracing::info!("frame source ended, stopping session");
                return Ok(());
            };
            // Skip hints are honored once
            self.skip_hint = 0;

            let Some(result) = self.infer_with_retry(frame).await? else {
                // Retries exhausted on a transient error: resume capture
                continue;
            };

            if !self.accept(&result) {
                continue;
            }

            for event in session.process(&result, Instant::now()) {
                if events.send(event).await.is_err() {
                    tracing::info!("event sink closed, stopping session");
                    return Ok(());
                }
            }
        }
    }

    /// Stale/duplicate rejection plus bookkeeping for an arrived result.
    ///
    /// Returns false when the result timestamp is at or before the last
    /// accepted one.
    fn accept(&mut self, result: &FrameResult) -> bool {
        if let Some(last) = self.last_accepted {
            if result.timestamp <= last {
                tracing::debug!("discarding stale inference result");
                return false;
            }
        }
        self.last_accepted = Some(result.timestamp);
        self.fps.record(Instant::now());
        if let Some(skip) = result.frame_skip_hint {
            self.skip_hint = skip;
        }
        true
    }

    /// One inference call with bounded linear backoff on transient
    /// failures. `Ok(None)` means retries were exhausted and the capture
    /// loop should resume; fatal errors propagate.
    async fn infer_with_retry(
        &mut self,
        frame: Frame,
    ) -> Result<Option<FrameResult>, StreamError> {
        for attempt in 0..=self.config.max_retries {
            match self.backend.infer(frame.clone()).await {
                Ok(result) => return Ok(Some(result)),
                Err(BackendError::Transient(msg)) => {
                    tracing::warn!(attempt, error = %msg, "transient inference failure");
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_backoff * (attempt + 1)).await;
                    }
                }
                Err(e @ BackendError::Fatal(_)) => return Err(e.into()),
            }
        }
        tracing::warn!("inference retries exhausted, resuming capture loop");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownEngine;
    use crate::session::Session;
    use crate::tracker::Tracker;
    use rollcall_core::gallery::Gallery;
    use rollcall_core::liveness::{LivenessStatus, NonLoggingSet};
    use rollcall_core::types::{BoundingBox, Embedding};
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_fps_basic_rate() {
        let mut est = FpsEstimator::new(30, Duration::ZERO);
        let t0 = Instant::now();
        for i in 0..11 {
            est.record(t0 + ms(20 * i)); // 50 Hz arrivals
        }
        assert!((est.fps() - 50.0).abs() < 1.0, "fps = {}", est.fps());
    }

    #[test]
    fn test_fps_update_rate_capped() {
        let mut est = FpsEstimator::new(30, ms(100));
        let t0 = Instant::now();
        est.record(t0);
        est.record(t0 + ms(20));
        // Second record arrives before the update interval elapsed:
        // the published estimate must not have been recomputed.
        assert_eq!(est.fps(), 0.0);
        est.record(t0 + ms(120));
        assert!(est.fps() > 0.0);
    }

    #[test]
    fn test_fps_window_bounded() {
        let mut est = FpsEstimator::new(5, Duration::ZERO);
        let t0 = Instant::now();
        // Slow arrivals first, then fast; only the fast ones fit the window
        for i in 0..5 {
            est.record(t0 + ms(1000 * i));
        }
        for i in 0..5 {
            est.record(t0 + ms(5000 + 10 * i));
        }
        assert!(est.fps() > 50.0, "fps = {}", est.fps());
    }

    // --- async controller tests with scripted source/backend ---

    struct ScriptedSource {
        frames: Vec<Frame>,
        pub skips_seen: Vec<u32>,
    }

    impl ScriptedSource {
        fn with_frames(n: usize) -> Self {
            let frames = (0..n).map(|_| Frame::new(vec![0u8; 16], 4, 4)).collect();
            Self { frames, skips_seen: Vec::new() }
        }
    }

    impl FrameSource for &mut ScriptedSource {
        async fn next_frame(&mut self, skip: u32) -> Option<Frame> {
            self.skips_seen.push(skip);
            if self.frames.is_empty() {
                None
            } else {
                Some(self.frames.remove(0))
            }
        }
    }

    enum Step {
        Result(FrameResult),
        Transient,
        Fatal,
    }

    struct ScriptedBackend {
        steps: Vec<Step>,
        not_ready_polls: u32,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<Step>) -> Self {
            Self { steps, not_ready_polls: 0 }
        }
    }

    impl InferenceBackend for ScriptedBackend {
        async fn ready(&mut self) -> Result<bool, BackendError> {
            if self.not_ready_polls > 0 {
                self.not_ready_polls -= 1;
                Ok(false)
            } else {
                Ok(true)
            }
        }

        async fn infer(&mut self, _frame: Frame) -> Result<FrameResult, BackendError> {
            if self.steps.is_empty() {
                return Err(BackendError::Transient("script exhausted".into()));
            }
            match self.steps.remove(0) {
                Step::Result(r) => Ok(r),
                Step::Transient => Err(BackendError::Transient("flaky".into())),
                Step::Fatal => Err(BackendError::Fatal("model unloaded".into())),
            }
        }
    }

    fn observation(embedding: Vec<f32>, track_id: u64) -> FaceObservation {
        let mut det = Detection::new(
            BoundingBox { x: 10.0, y: 10.0, width: 60.0, height: 60.0 },
            0.9,
            None,
        );
        det.track_id = Some(track_id);
        FaceObservation {
            detection: det,
            embedding: Some(Embedding::from_raw(embedding)),
            liveness: LivenessResult {
                is_real: Some(true),
                confidence: 0.95,
                status: LivenessStatus::Real,
            },
        }
    }

    fn result_at(ts: Instant, faces: Vec<FaceObservation>, skip: Option<u32>) -> FrameResult {
        FrameResult { timestamp: ts, faces, frame_skip_hint: skip }
    }

    fn test_session(cooldown_secs: u64) -> Session {
        let gallery = Arc::new(Gallery::new(0.6));
        gallery.register("alice", Embedding::from_raw(vec![1.0, 0.0]));
        Session::new(
            Arc::clone(&gallery),
            Tracker::default(),
            CooldownEngine::new(
                Duration::from_secs(cooldown_secs),
                NonLoggingSet::default(),
                "test-camera",
            ),
        )
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            readiness_poll_interval: ms(1),
            readiness_timeout: ms(50),
            retry_backoff: ms(1),
            max_retries: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_results_discarded() {
        let t0 = Instant::now();
        let mut source = ScriptedSource::with_frames(3);
        // Second result repeats the first timestamp: must be dropped
        let backend = ScriptedBackend::new(vec![
            Step::Result(result_at(t0, vec![observation(vec![1.0, 0.0], 1)], None)),
            Step::Result(result_at(t0, vec![observation(vec![1.0, 0.0], 1)], None)),
            Step::Result(result_at(t0 + ms(100), vec![], None)),
        ]);
        let mut session = test_session(0);
        let mut controller = StreamController::new(&mut source, backend, test_config());
        let (tx, mut rx) = mpsc::channel(16);

        controller.run(&mut session, tx).await.unwrap();

        // Cooldown 0, so any accepted matching observation emits — the
        // duplicate-timestamp result must not have produced a second event.
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_skip_hint_honored_once() {
        let t0 = Instant::now();
        let mut source = ScriptedSource::with_frames(3);
        let backend = ScriptedBackend::new(vec![
            Step::Result(result_at(t0, vec![], Some(2))),
            Step::Result(result_at(t0 + ms(10), vec![], None)),
            Step::Result(result_at(t0 + ms(20), vec![], None)),
        ]);
        let mut session = test_session(0);
        let mut controller = StreamController::new(&mut source, backend, test_config());
        let (tx, _rx) = mpsc::channel(16);

        controller.run(&mut session, tx).await.unwrap();

        assert_eq!(source.skips_seen, vec![0, 2, 0, 0]);
    }

    #[tokio::test]
    async fn test_transient_error_resumes_loop() {
        let t0 = Instant::now();
        let mut source = ScriptedSource::with_frames(2);
        // First frame fails transiently through every retry, second succeeds
        let backend = ScriptedBackend::new(vec![
            Step::Transient,
            Step::Transient,
            Step::Transient,
            Step::Result(result_at(t0, vec![observation(vec![1.0, 0.0], 1)], None)),
        ]);
        let mut session = test_session(0);
        let mut controller = StreamController::new(&mut source, backend, test_config());
        let (tx, mut rx) = mpsc::channel(16);

        controller.run(&mut session, tx).await.unwrap();

        assert!(rx.try_recv().is_ok(), "second frame should still emit");
    }

    #[tokio::test]
    async fn test_fatal_error_propagates() {
        let mut source = ScriptedSource::with_frames(2);
        let backend = ScriptedBackend::new(vec![Step::Fatal]);
        let mut session = test_session(0);
        let mut controller = StreamController::new(&mut source, backend, test_config());
        let (tx, _rx) = mpsc::channel(16);

        let err = controller.run(&mut session, tx).await.unwrap_err();
        assert!(matches!(err, StreamError::Backend(BackendError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_session_state_cleared_on_exit() {
        let t0 = Instant::now();
        let mut source = ScriptedSource::with_frames(1);
        let backend = ScriptedBackend::new(vec![Step::Result(result_at(
            t0,
            vec![observation(vec![1.0, 0.0], 1)],
            None,
        ))]);
        let mut session = test_session(300);
        let mut controller = StreamController::new(&mut source, backend, test_config());
        let (tx, _rx) = mpsc::channel(16);

        controller.run(&mut session, tx).await.unwrap();

        assert!(session.tracker().is_empty());
        assert!(!session.cooldown().in_cooldown("alice", Instant::now()));
    }

    #[tokio::test]
    async fn test_wait_ready_polls_until_ready() {
        let mut backend = ScriptedBackend::new(vec![]);
        backend.not_ready_polls = 3;
        let mut source = ScriptedSource::with_frames(0);
        let mut controller = StreamController::new(&mut source, backend, test_config());

        controller.wait_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        struct NeverReady;
        impl InferenceBackend for NeverReady {
            async fn ready(&mut self) -> Result<bool, BackendError> {
                Ok(false)
            }
            async fn infer(&mut self, _frame: Frame) -> Result<FrameResult, BackendError> {
                unreachable!()
            }
        }

        let mut source = ScriptedSource::with_frames(0);
        let mut controller = StreamController::new(&mut source, NeverReady, test_config());

        let err = controller.wait_ready().await.unwrap_err();
        assert!(matches!(err, StreamError::StartupTimeout(_)));
    }
}
