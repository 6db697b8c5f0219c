//! Scan session controller.
//!
//! Drives one face scan end to end: arms the camera, polls detections into
//! the gesture detector on a fixed interval, runs identity resolution once
//! the liveness challenge completes, and recovers from fatal errors with a
//! timed reset. Everything the user sees is published as [`ScanEvent`]s and
//! mirrored into a [`ScanView`] snapshot.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bounty_core::{GestureDetector, GestureEvent, GestureState, REQUIRED_BLINKS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::camera::{CameraError, DetectorError};
use crate::engine::{DetectionSource, EngineError};
use crate::resolve::{Identified, IdentityResolver, ResolveError, ResolveStep, Resolution, Route};

const STATUS_BLINK_PROMPT: &str = "Please blink twice (0/2)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub tick_interval: Duration,
    pub reset_delay: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            reset_delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A terminal line.
    Line(String),
    /// The one-line status message changed.
    Status(String),
    Progress(u8),
    /// A fatal error was shown; a reset follows after the configured delay.
    Fatal(String),
    Reset { generation: u64 },
    Resolved(Resolution),
}

/// Everything currently on screen.
#[derive(Debug, Clone, Default)]
pub struct ScanView {
    pub lines: Vec<String>,
    pub status: String,
    pub progress: u8,
    pub has_error: bool,
    pub gesture: GestureState,
    pub generation: u64,
    pub resolution: Option<Resolution>,
}

#[derive(Debug)]
enum ScanCommand {
    Reset,
    Shutdown,
}

/// Control surface for a running [`ScanController`].
#[derive(Clone)]
pub struct ScanHandle {
    commands: mpsc::UnboundedSender<ScanCommand>,
    view: Arc<Mutex<ScanView>>,
}

impl ScanHandle {
    /// Zero the gesture state, clear the terminal and re-arm the camera.
    pub fn reset_scan(&self) {
        let _ = self.commands.send(ScanCommand::Reset);
    }

    /// Stop the controller. The camera is released on the way out.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ScanCommand::Shutdown);
    }

    pub fn snapshot(&self) -> ScanView {
        self.view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct PendingResolution {
    task: JoinHandle<(u64, Result<Identified, ResolveError>)>,
    steps: mpsc::UnboundedReceiver<ResolveStep>,
    steps_open: bool,
}

enum Control {
    Next(Phase),
    Stay,
    Stop,
}

enum Phase {
    Scanning,
    Resolving(PendingResolution),
    Redirecting {
        resolution: Resolution,
        at: Instant,
    },
    Failed {
        reset_at: Instant,
    },
}

pub struct ScanController {
    source: Arc<dyn DetectionSource>,
    resolver: Arc<IdentityResolver>,
    settings: ScanSettings,
    detector: GestureDetector,
    view: Arc<Mutex<ScanView>>,
    events: mpsc::UnboundedSender<ScanEvent>,
    commands: mpsc::UnboundedReceiver<ScanCommand>,
    commands_open: bool,
    generation: u64,
    resolution_started: bool,
    started: Instant,
}

impl ScanController {
    pub fn new(
        source: Arc<dyn DetectionSource>,
        resolver: Arc<IdentityResolver>,
        settings: ScanSettings,
    ) -> (Self, ScanHandle, mpsc::UnboundedReceiver<ScanEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let view = Arc::new(Mutex::new(ScanView::default()));

        let controller = Self {
            source,
            resolver,
            settings,
            detector: GestureDetector::new(),
            view: view.clone(),
            events: event_tx,
            commands: cmd_rx,
            commands_open: true,
            generation: 0,
            resolution_started: false,
            started: Instant::now(),
        };
        let handle = ScanHandle {
            commands: cmd_tx,
            view,
        };
        (controller, handle, event_rx)
    }

    /// Run until the user is redirected or the controller is shut down.
    pub async fn run(mut self) -> Option<Resolution> {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut phase = self.arm().await;

        let outcome = loop {
            let next = match &mut phase {
                Phase::Scanning => tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if self.commands_open => {
                        match self.on_command(cmd).await {
                            Control::Next(next) => next,
                            Control::Stop => break None,
                            Control::Stay => continue,
                        }
                    }
                    _ = ticker.tick() => self.tick().await,
                },
                Phase::Resolving(pending) => tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if self.commands_open => {
                        // A reset detaches the task: its writes finish, its
                        // result is never applied.
                        match self.on_command(cmd).await {
                            Control::Next(next) => next,
                            Control::Stop => break None,
                            Control::Stay => continue,
                        }
                    }
                    step = pending.steps.recv(), if pending.steps_open => {
                        match step {
                            Some(step) => self.on_step(&step),
                            None => pending.steps_open = false,
                        }
                        continue;
                    }
                    joined = &mut pending.task => {
                        while let Ok(step) = pending.steps.try_recv() {
                            self.on_step(&step);
                        }
                        match joined {
                            Ok((generation, result)) => self.on_resolved(generation, result),
                            Err(e) => {
                                tracing::error!(error = %e, "resolution task failed");
                                self.fail(
                                    format!("Verification failed: {e}. System will reset automatically."),
                                    vec![format!("> ERROR: {e}")],
                                )
                            }
                        }
                    }
                },
                Phase::Redirecting { resolution, at } => tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if self.commands_open => {
                        match self.on_command(cmd).await {
                            Control::Next(next) => next,
                            Control::Stop => break None,
                            Control::Stay => continue,
                        }
                    }
                    _ = tokio::time::sleep_until(*at) => break Some(resolution.clone()),
                },
                Phase::Failed { reset_at } => tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if self.commands_open => {
                        match self.on_command(cmd).await {
                            Control::Next(next) => next,
                            Control::Stop => break None,
                            Control::Stay => continue,
                        }
                    }
                    _ = tokio::time::sleep_until(*reset_at) => self.reset().await,
                },
            };
            phase = next;
        };

        self.source.release().await;
        match &outcome {
            Some(resolution) => tracing::info!(
                user_id = %resolution.user_id,
                route = %resolution.route,
                "scan finished"
            ),
            None => tracing::info!("scan stopped"),
        }
        outcome
    }

    async fn on_command(&mut self, cmd: Option<ScanCommand>) -> Control {
        match cmd {
            Some(ScanCommand::Reset) => Control::Next(self.reset().await),
            Some(ScanCommand::Shutdown) => Control::Stop,
            None => {
                // Every handle dropped; carry on without a control surface
                self.commands_open = false;
                Control::Stay
            }
        }
    }

    async fn arm(&mut self) -> Phase {
        self.set_status("Loading face detection models...");
        match self.source.arm().await {
            Ok(()) => {
                self.started = Instant::now();
                self.push_line("> Face detection models loaded successfully");
                self.push_line("> Starting real-time face tracking...");
                self.set_status(STATUS_BLINK_PROMPT);
                tracing::info!(generation = self.generation, "scan armed");
                Phase::Scanning
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to arm scan");
                let (status, lines) = match &e {
                    EngineError::Camera(CameraError::PermissionDenied) => (
                        "Error: Camera access denied".to_string(),
                        vec![
                            "> ERROR: Camera access denied".to_string(),
                            "> Please allow camera permissions".to_string(),
                        ],
                    ),
                    EngineError::Detector(DetectorError::ModelLoad(_)) => (
                        "Error loading face detection models".to_string(),
                        vec!["> ERROR: Failed to load face detection models".to_string()],
                    ),
                    other => (format!("Error: {other}"), vec![format!("> ERROR: {other}")]),
                };
                self.fail(status, lines)
            }
        }
    }

    async fn tick(&mut self) -> Phase {
        let faces = match self.source.detect(false).await {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "detection tick failed");
                return Phase::Scanning;
            }
        };
        // No face this tick: nothing changes
        let Some(face) = faces.first() else {
            return Phase::Scanning;
        };

        match self.detector.process(face, self.started.elapsed()) {
            Ok(events) => {
                for event in events {
                    self.on_gesture(event);
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping malformed detection"),
        }

        let progress = self.detector.progress();
        let changed = self.update_view(|view| {
            view.gesture = self.detector.state().clone();
            let changed = view.progress != progress;
            view.progress = progress;
            changed
        });
        if changed {
            self.emit(ScanEvent::Progress(progress));
        }

        if self.detector.state().verification_complete() && !self.resolution_started {
            self.resolution_started = true;
            return self.start_resolution();
        }
        Phase::Scanning
    }

    fn start_resolution(&mut self) -> Phase {
        let (tx, rx) = mpsc::unbounded_channel();
        let resolver = self.resolver.clone();
        let source = self.source.clone();
        let generation = self.generation;

        tracing::info!(generation, "liveness verified, resolving identity");
        // Only store writes happen here; the session is bound once the
        // result is known to belong to the current generation.
        let task = tokio::spawn(async move {
            let result = match resolver.capture(source.as_ref(), &tx).await {
                Ok(descriptor) => resolver.match_identity(&descriptor, &tx).await,
                Err(e) => Err(e),
            };
            (generation, result)
        });

        Phase::Resolving(PendingResolution {
            task,
            steps: rx,
            steps_open: true,
        })
    }

    fn on_resolved(&mut self, generation: u64, result: Result<Identified, ResolveError>) -> Phase {
        if generation != self.generation {
            tracing::debug!(generation, current = self.generation, "discarding stale resolution");
            return Phase::Scanning;
        }
        match result.and_then(|identified| self.bind_session(identified)) {
            Ok(resolution) => {
                self.update_view(|view| view.resolution = Some(resolution.clone()));
                self.emit(ScanEvent::Resolved(resolution.clone()));
                Phase::Redirecting {
                    at: Instant::now() + resolution.redirect_after,
                    resolution,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "identity resolution failed");
                self.fail(
                    format!("Verification failed: {e}. System will reset automatically."),
                    vec![format!("> ERROR: {e}")],
                )
            }
        }
    }

    fn bind_session(&mut self, identified: Identified) -> Result<Resolution, ResolveError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.resolver.bind_session(identified, &tx);
        while let Ok(step) = rx.try_recv() {
            self.on_step(&step);
        }
        result
    }

    async fn reset(&mut self) -> Phase {
        self.generation += 1;
        self.detector.reset();
        self.resolution_started = false;
        self.source.release().await;

        let generation = self.generation;
        self.update_view(|view| {
            *view = ScanView {
                generation,
                ..ScanView::default()
            };
        });
        self.emit(ScanEvent::Reset { generation });
        self.emit(ScanEvent::Progress(0));
        tracing::info!(generation, "scan reset");

        self.push_line("> System reset - Starting new scan...");
        self.set_status(STATUS_BLINK_PROMPT);
        self.arm().await
    }

    fn fail(&mut self, status: String, lines: Vec<String>) -> Phase {
        for line in lines {
            self.push_line(line);
        }
        let delay = self.settings.reset_delay.as_millis() as f64 / 1000.0;
        self.push_line(format!("> System will reset in {delay} seconds..."));
        self.set_status(status.clone());
        self.update_view(|view| view.has_error = true);
        self.emit(ScanEvent::Fatal(status));
        Phase::Failed {
            reset_at: Instant::now() + self.settings.reset_delay,
        }
    }

    fn on_gesture(&mut self, event: GestureEvent) {
        tracing::debug!(?event, "gesture");
        match event {
            GestureEvent::BlinkDetected { count } => {
                self.push_line(format!("> Blink detected ({count}/{REQUIRED_BLINKS})"));
                self.set_status(format!("Please blink twice ({count}/{REQUIRED_BLINKS})"));
            }
            GestureEvent::BlinksComplete => {
                self.push_line("> Blink verification complete ✓");
                self.set_status("Blink verification complete! Now turn your head left");
            }
            GestureEvent::HeadPoseStarted => {
                self.push_line("> Initiating head pose verification...");
            }
            GestureEvent::HeadLeftVerified => {
                self.push_line("> Head left verified ✓");
                self.set_status("Great! Now turn your head right");
            }
            GestureEvent::HeadRightVerified => {
                self.push_line("> Head right verified ✓");
            }
            GestureEvent::VerificationComplete => {
                self.push_line("> Generating face descriptor...");
                self.set_status("Verification complete! Checking database...");
            }
        }
    }

    fn on_step(&mut self, step: &ResolveStep) {
        for line in step_lines(step) {
            self.push_line(line);
        }
    }

    fn push_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.update_view(|view| view.lines.push(line.clone()));
        self.emit(ScanEvent::Line(line));
    }

    fn set_status(&mut self, status: impl Into<String>) {
        let status = status.into();
        let changed = self.update_view(|view| {
            let changed = view.status != status;
            view.status.clone_from(&status);
            changed
        });
        if changed {
            self.emit(ScanEvent::Status(status));
        }
    }

    fn update_view<R>(&self, f: impl FnOnce(&mut ScanView) -> R) -> R {
        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut view)
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(event);
    }
}

/// Terminal lines for one resolution step.
pub fn step_lines(step: &ResolveStep) -> Vec<String> {
    match step {
        ResolveStep::ComputingEmbedding => vec!["> Computing face embedding vectors...".into()],
        ResolveStep::DescriptorCaptured => {
            vec!["> Face vector generated (128 dimensions)".into()]
        }
        ResolveStep::QueryingStore => vec!["> Querying face vector database...".into()],
        ResolveStep::MatchFound {
            user_id,
            similarity,
        } => vec![
            format!("> ✓ MATCH FOUND! Similarity: {:.2}%", similarity * 100.0),
            format!("> User UUID: {user_id}"),
        ],
        ResolveStep::NoMatch { .. } => vec![
            "> No matching face in database".into(),
            "> Status: NEW USER DETECTED".into(),
        ],
        ResolveStep::SessionCleared => vec!["> Cleared previous session data".into()],
        ResolveStep::CheckingProfile => vec!["> Checking user profile completeness...".into()],
        ResolveStep::ProfileComplete => vec!["> ✓ All required fields present!".into()],
        ResolveStep::ProfileIncomplete => vec!["> Missing required fields".into()],
        ResolveStep::ProfileMissing => vec!["> ⚠ No user profile found".into()],
        ResolveStep::ProfileLookupFailed => vec!["> ⚠ Profile store unavailable".into()],
        ResolveStep::UserIdGenerated(id) => vec![format!("> UUID generated: {id}")],
        ResolveStep::DescriptorStored(_) => vec!["> ✓ Face vector stored".into()],
        ResolveStep::ProfileCreated => vec!["> ✓ User profile created".into()],
        ResolveStep::ProfileDeferred => {
            vec!["> ⚠ User profile creation failed - will create on identity page".into()]
        }
        ResolveStep::SessionCreated(session_id) => {
            let short: String = session_id.chars().take(20).collect();
            vec![format!("> ✓ New session created: {short}...")]
        }
        ResolveStep::Redirecting(route) => vec![match route {
            Route::Dashboard(_) => "> Redirecting to dashboard...".into(),
            Route::Identity(_) => "> Redirecting to identity page to complete profile...".into(),
            Route::FaceScan => "> Returning to face scan...".into(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::CompletenessPolicy;
    use crate::repository::{FaceVectorStore, MemoryStore, StoredFaceRecord};
    use crate::session::SessionManager;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use bounty_core::{FaceDescriptor, LandmarkFrame, Point, DESCRIPTOR_DIM};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Clone, Copy)]
    enum ArmFailure {
        CameraDenied,
        ModelLoad,
    }

    /// Plays scripted detections, one entry per tick, then repeats the last.
    struct ScriptedSource {
        script: Vec<LandmarkFrame>,
        replay_on_arm: bool,
        frames: Mutex<VecDeque<LandmarkFrame>>,
        last: Mutex<Option<LandmarkFrame>>,
        fail_arm: Option<ArmFailure>,
        descriptor_requests: AtomicUsize,
        releases: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(frames: Vec<LandmarkFrame>) -> Self {
            Self {
                script: frames.clone(),
                replay_on_arm: false,
                frames: Mutex::new(frames.into()),
                last: Mutex::new(None),
                fail_arm: None,
                descriptor_requests: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }
        }

        /// Starts the script over every time the camera is re-armed.
        fn looping(frames: Vec<LandmarkFrame>) -> Self {
            Self {
                replay_on_arm: true,
                ..Self::new(frames)
            }
        }

        fn failing(failure: ArmFailure) -> Self {
            Self {
                fail_arm: Some(failure),
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl DetectionSource for ScriptedSource {
        async fn arm(&self) -> Result<(), EngineError> {
            match self.fail_arm {
                Some(ArmFailure::CameraDenied) => {
                    Err(EngineError::Camera(CameraError::PermissionDenied))
                }
                Some(ArmFailure::ModelLoad) => Err(EngineError::Detector(
                    DetectorError::ModelLoad("missing weights".into()),
                )),
                None => {
                    if self.replay_on_arm {
                        *self.frames.lock().unwrap() = self.script.clone().into();
                        *self.last.lock().unwrap() = None;
                    }
                    Ok(())
                }
            }
        }

        async fn detect(&self, with_descriptors: bool) -> Result<Vec<LandmarkFrame>, EngineError> {
            let mut last = self.last.lock().unwrap();
            if with_descriptors {
                self.descriptor_requests.fetch_add(1, Ordering::SeqCst);
                let mut face = last.clone().unwrap_or_else(|| frame(5.0, 0.0));
                face.descriptor = Some(scanned_face().values().to_vec());
                return Ok(vec![face]);
            }
            if let Some(next) = self.frames.lock().unwrap().pop_front() {
                *last = Some(next);
            }
            Ok(last.iter().cloned().collect())
        }

        async fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Vector store whose inserts take a while. Each insert takes the next
    /// delay in line; once they run out inserts are immediate.
    struct SlowVectors {
        inner: Arc<MemoryStore>,
        delays: Mutex<VecDeque<Duration>>,
    }

    impl SlowVectors {
        fn new(inner: Arc<MemoryStore>, delays: &[Duration]) -> Self {
            Self {
                inner,
                delays: Mutex::new(delays.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl FaceVectorStore for SlowVectors {
        async fn insert(
            &self,
            descriptor: &FaceDescriptor,
            user_id: Uuid,
        ) -> Result<StoredFaceRecord, StoreError> {
            let delay = self.delays.lock().unwrap().pop_front().unwrap_or_default();
            tokio::time::sleep(delay).await;
            self.inner.insert(descriptor, user_id).await
        }
        async fn scan_all(&self) -> Result<Vec<StoredFaceRecord>, StoreError> {
            self.inner.scan_all().await
        }
        async fn count_faces(&self) -> Result<u64, StoreError> {
            self.inner.count_faces().await
        }
    }

    fn scanned_face() -> FaceDescriptor {
        let mut values = vec![0.0f32; DESCRIPTOR_DIM];
        values[0] = 1.0;
        FaceDescriptor::new(values).unwrap()
    }

    /// Eye contour centred at (cx, cy); EAR = 2 * open / 30.
    fn eye(cx: f32, cy: f32, open: f32) -> Vec<Point> {
        vec![
            Point::new(cx - 15.0, cy),
            Point::new(cx - 7.5, cy - open),
            Point::new(cx + 7.5, cy - open),
            Point::new(cx + 15.0, cy),
            Point::new(cx + 7.5, cy + open),
            Point::new(cx - 7.5, cy + open),
        ]
    }

    fn frame(open: f32, tilt: f32) -> LandmarkFrame {
        let d = 60.0f32;
        let dy = tilt * d;
        let dx = (d * d - dy * dy).sqrt();
        LandmarkFrame {
            left_eye: eye(100.0, 100.0, open),
            right_eye: eye(100.0 + dx, 100.0 + dy, open),
            descriptor: None,
        }
    }

    /// Two blinks 1200ms apart at a 100ms tick, then left and right turns.
    fn liveness_script() -> Vec<LandmarkFrame> {
        let mut frames = vec![frame(2.0, 0.0)];
        frames.extend((1..12).map(|_| frame(5.0, 0.0)));
        frames.push(frame(2.0, 0.0));
        frames.push(frame(5.0, -0.3));
        frames.push(frame(5.0, -0.3));
        frames.push(frame(5.0, 0.3));
        frames
    }

    fn resolver_over(
        vectors: Arc<dyn FaceVectorStore>,
        profiles: Arc<MemoryStore>,
    ) -> Arc<IdentityResolver> {
        Arc::new(IdentityResolver::new(
            vectors,
            profiles,
            SessionManager::in_memory(),
            CompletenessPolicy::Extended,
        ))
    }

    fn spawn(
        source: Arc<ScriptedSource>,
        resolver: Arc<IdentityResolver>,
    ) -> (
        JoinHandle<Option<Resolution>>,
        ScanHandle,
        mpsc::UnboundedReceiver<ScanEvent>,
    ) {
        let (controller, handle, events) =
            ScanController::new(source, resolver, ScanSettings::default());
        (tokio::spawn(controller.run()), handle, events)
    }

    fn count_lines(events: &[ScanEvent], text: &str) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Line(l) if l == text))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_scan_resolves_once() {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(ScriptedSource::new(liveness_script()));
        let (task, _handle, mut events) =
            spawn(source.clone(), resolver_over(store.clone(), store.clone()));

        let resolution = task.await.unwrap().expect("scan should resolve");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }

        let progress: Vec<u8> = seen
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![25, 50, 75, 100]);

        let resolved = seen
            .iter()
            .filter(|e| matches!(e, ScanEvent::Resolved(_)))
            .count();
        assert_eq!(resolved, 1);
        assert_eq!(source.descriptor_requests.load(Ordering::SeqCst), 1);

        assert_eq!(count_lines(&seen, "> Blink detected (1/2)"), 1);
        assert_eq!(count_lines(&seen, "> Blink verification complete ✓"), 1);
        assert_eq!(count_lines(&seen, "> Head left verified ✓"), 1);
        assert_eq!(count_lines(&seen, "> Head right verified ✓"), 1);
        assert_eq!(count_lines(&seen, "> Status: NEW USER DETECTED"), 1);

        assert!(resolution.is_new_user());
        assert_eq!(resolution.route, Route::Identity(resolution.user_id));
        assert_eq!(store.count_faces().await.unwrap(), 1);
        assert!(source.releases.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_denial_resets_after_delay() {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(ScriptedSource::failing(ArmFailure::CameraDenied));
        let (task, handle, mut events) = spawn(source, resolver_over(store.clone(), store));

        let denied_at = loop {
            match events.recv().await {
                Some(ScanEvent::Fatal(status)) => {
                    assert_eq!(status, "Error: Camera access denied");
                    break Instant::now();
                }
                Some(_) => {}
                None => panic!("controller exited"),
            }
        };

        let view = handle.snapshot();
        assert!(view.has_error);
        assert!(view
            .lines
            .contains(&"> ERROR: Camera access denied".to_string()));
        assert!(view
            .lines
            .contains(&"> System will reset in 3 seconds...".to_string()));

        loop {
            match events.recv().await {
                Some(ScanEvent::Reset { generation }) => {
                    assert_eq!(generation, 1);
                    break;
                }
                Some(_) => {}
                None => panic!("controller exited"),
            }
        }
        let elapsed = denied_at.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "{elapsed:?}");

        // Reset zeroes the gesture state before re-arming fails again
        let reset_view = handle.snapshot();
        assert_eq!(reset_view.gesture, GestureState::default());
        assert_eq!(reset_view.progress, 0);

        handle.shutdown();
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_load_failure_is_fatal() {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(ScriptedSource::failing(ArmFailure::ModelLoad));
        let (task, handle, mut events) = spawn(source, resolver_over(store.clone(), store));

        loop {
            match events.recv().await {
                Some(ScanEvent::Fatal(status)) => {
                    assert_eq!(status, "Error loading face detection models");
                    break;
                }
                Some(_) => {}
                None => panic!("controller exited"),
            }
        }
        let view = handle.snapshot();
        assert!(view
            .lines
            .contains(&"> ERROR: Failed to load face detection models".to_string()));

        handle.shutdown();
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_resolution_discards_result() {
        let profiles = Arc::new(MemoryStore::default());
        let faces = Arc::new(MemoryStore::default());
        let vectors = Arc::new(SlowVectors::new(faces.clone(), &[Duration::from_secs(2)]));
        let source = Arc::new(ScriptedSource::new(liveness_script()));
        let resolver = resolver_over(vectors, profiles);
        let (task, handle, mut events) = spawn(source, resolver.clone());

        loop {
            match events.recv().await {
                Some(ScanEvent::Line(line)) if line.starts_with("> UUID generated:") => break,
                Some(_) => {}
                None => panic!("controller exited"),
            }
        }
        handle.reset_scan();

        tokio::time::sleep(Duration::from_secs(5)).await;

        // The detached write landed, but nothing from it reached the screen
        // or the session store
        assert_eq!(faces.count_faces().await.unwrap(), 1);
        assert!(resolver.sessions().current().unwrap().is_none());
        let view = handle.snapshot();
        assert_eq!(view.generation, 1);
        assert!(view.resolution.is_none());
        assert!(!view.lines.iter().any(|l| l.starts_with("> ✓ New session created")));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ScanEvent::Resolved(_)));
        }

        handle.shutdown();
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_resolution_cannot_replace_live_session() {
        let profiles = Arc::new(MemoryStore::default());
        let faces = Arc::new(MemoryStore::default());
        // The first enrollment stalls; the second goes straight through
        let vectors = Arc::new(SlowVectors::new(faces.clone(), &[Duration::from_secs(10)]));
        let source = Arc::new(ScriptedSource::looping(liveness_script()));
        let resolver = resolver_over(vectors, profiles);
        let (task, handle, mut events) = spawn(source, resolver.clone());

        let stale_user = loop {
            match events.recv().await {
                Some(ScanEvent::Line(line)) => {
                    if let Some(id) = line.strip_prefix("> UUID generated: ") {
                        break Uuid::parse_str(id).unwrap();
                    }
                }
                Some(_) => {}
                None => panic!("controller exited"),
            }
        };
        handle.reset_scan();

        let live = loop {
            match events.recv().await {
                Some(ScanEvent::Resolved(resolution)) => break resolution,
                Some(_) => {}
                None => panic!("controller exited"),
            }
        };
        assert_ne!(live.user_id, stale_user);
        assert_eq!(
            resolver.sessions().current().unwrap().unwrap().user_id,
            live.user_id
        );

        // Let the stalled enrollment finish
        tokio::time::sleep(Duration::from_secs(20)).await;

        let owners: Vec<Uuid> = faces
            .scan_all()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.user_id)
            .collect();
        assert!(owners.contains(&stale_user));
        assert!(owners.contains(&live.user_id));

        let session = resolver.sessions().current().unwrap().unwrap();
        assert_eq!(session.user_id, live.user_id);
        assert_eq!(session, live.session);

        let finished = task.await.unwrap().expect("second scan should resolve");
        assert_eq!(finished.user_id, live.user_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_failure_shows_error_and_resets() {
        struct NoFaceSource(ScriptedSource);

        #[async_trait]
        impl DetectionSource for NoFaceSource {
            async fn arm(&self) -> Result<(), EngineError> {
                self.0.arm().await
            }
            async fn detect(&self, with_descriptors: bool) -> Result<Vec<LandmarkFrame>, EngineError> {
                if with_descriptors {
                    return Ok(Vec::new());
                }
                self.0.detect(false).await
            }
            async fn release(&self) {}
        }

        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(NoFaceSource(ScriptedSource::new(liveness_script())));
        let (controller, handle, mut events) = ScanController::new(
            source,
            resolver_over(store.clone(), store.clone()),
            ScanSettings::default(),
        );
        let task = tokio::spawn(controller.run());

        loop {
            match events.recv().await {
                Some(ScanEvent::Fatal(status)) => {
                    assert!(status.starts_with("Verification failed: no face detected"));
                    break;
                }
                Some(_) => {}
                None => panic!("controller exited"),
            }
        }
        assert!(handle
            .snapshot()
            .lines
            .contains(&"> ERROR: no face detected".to_string()));

        loop {
            if let Some(ScanEvent::Reset { .. }) = events.recv().await {
                break;
            }
        }
        assert_eq!(store.count_faces().await.unwrap(), 0);

        handle.shutdown();
        assert!(task.await.unwrap().is_none());
    }

    #[test]
    fn test_session_line_is_truncated() {
        let lines = step_lines(&ResolveStep::SessionCreated(
            "session-6f1c2d3e-aaaa-4bbb-8ccc-000000000000-1700000000000".into(),
        ));
        assert_eq!(lines, vec!["> ✓ New session created: session-6f1c2d3e-aaa...".to_string()]);
    }

    #[test]
    fn test_match_line_formats_percentage() {
        let lines = step_lines(&ResolveStep::MatchFound {
            user_id: Uuid::nil(),
            similarity: 0.9234,
        });
        assert_eq!(lines[0], "> ✓ MATCH FOUND! Similarity: 92.34%");
    }
}
