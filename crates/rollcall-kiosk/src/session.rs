//! One kiosk terminal: detection polling, check-in attempts, the offline
//! drain worker and the realtime merge listener, wired around a shared
//! cooldown store.
//!
//! Background work runs on spawned tokio tasks. Every cycle is also
//! callable directly through [`KioskSession::run_cycle`], which is how tests
//! drive the session frame by frame.

use crate::capture::Frame;
use crate::collaborators::{
    Collaborators, DescriptorExtractor, FaceDetector, QrDecoder, RosterSource,
};
use crate::config::KioskConfig;
use crate::error::CheckinError;
use crate::events::{KioskEvent, KioskView, ViewState};
use crate::mode::{CaptureMode, ModeCoordinator};
use crate::queue::{DrainReport, OfflineQueue};
use crate::realtime::MergeListener;
use crate::roster::load_matcher;
use crate::submitter::{SubmitResolution, Submitter};
use rollcall_core::{
    parse_code, CheckinMethod, CheckinPayload, Clock, CooldownStore, DescriptorMatcher,
    EventContext, Observation, Signal, Tracker,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What one polling cycle did.
#[derive(Debug)]
pub enum CycleReport {
    /// A previous cycle or an attempt was still running.
    Skipped,
    /// The active capture source produced no frame.
    NoFrame,
    /// The detector failed; tracking was reset.
    DetectionUnavailable,
    /// A face-mode cycle that did not start an attempt.
    Face(Signal),
    /// A QR-mode cycle that did not start an attempt.
    Qr(QrOutcome),
    /// A submission was started; the handle resolves when it finishes.
    Attempting(JoinHandle<Option<SubmitResolution>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrOutcome {
    NoCode,
    Unknown { code: String },
    AlreadyCheckedIn { identity_id: String },
    /// The backend refused this card; held until it leaves view.
    Rejected { identity_id: String },
}

/// Last code seen in QR mode, so a held card is handled once.
struct SeenCode {
    raw: String,
    identity_id: Option<String>,
}

struct AttemptRequest {
    identity_id: String,
    display_name: String,
    method: CheckinMethod,
    confidence: f32,
    captured_at: chrono::DateTime<chrono::Utc>,
}

struct Shared {
    config: KioskConfig,
    event: EventContext,
    clock: Arc<dyn Clock>,
    matcher: Arc<RwLock<DescriptorMatcher>>,
    tracker: Mutex<Tracker>,
    cooldown: Arc<CooldownStore>,
    submitter: Submitter,
    listener: MergeListener,
    mode: ModeCoordinator,
    detector: Arc<dyn FaceDetector>,
    qr_decoder: Arc<dyn QrDecoder>,
    roster: Arc<dyn RosterSource>,
    extractor: Arc<dyn DescriptorExtractor>,
    connectivity: watch::Receiver<bool>,
    busy: AtomicBool,
    last_code: Mutex<Option<SeenCode>>,
    view: watch::Sender<KioskView>,
    events: broadcast::Sender<KioskEvent>,
}

/// Held for the duration of a cycle, and of the attempt it starts.
struct BusyGuard(Arc<Shared>);

impl BusyGuard {
    fn acquire(shared: &Arc<Shared>) -> Option<Self> {
        shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(Arc::clone(shared)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

pub struct KioskSession {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KioskSession {
    /// Build a session and start its background tasks.
    pub async fn start(
        config: KioskConfig,
        event: EventContext,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CheckinError> {
        let session = Self::new(config, event, collaborators, clock).await?;
        session.spawn_background();
        Ok(session)
    }

    /// Build a session backed by the on-disk queue at `config.queue_db_path`.
    ///
    /// Loads the roster and acquires the initial capture source, but spawns
    /// nothing; see [`KioskSession::spawn_background`].
    pub async fn new(
        config: KioskConfig,
        event: EventContext,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CheckinError> {
        let queue = OfflineQueue::open(&config.queue_db_path).await?;
        Self::with_queue(config, event, collaborators, clock, queue).await
    }

    pub async fn with_queue(
        config: KioskConfig,
        event: EventContext,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        queue: OfflineQueue,
    ) -> Result<Self, CheckinError> {
        config.validate()?;
        let Collaborators {
            roster,
            extractor,
            detector,
            qr_decoder,
            backend,
            feed,
            face_camera,
            qr_camera,
            connectivity,
        } = collaborators;

        let matcher = load_matcher(
            roster.as_ref(),
            extractor.as_ref(),
            &event.event_id,
            clock.now(),
        )
        .await?;
        let cooldown = Arc::new(CooldownStore::new(config.cooldown()));
        register_aliases(&cooldown, &matcher);
        let matcher = Arc::new(RwLock::new(matcher));

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let submitter = Submitter::new(
            backend,
            queue,
            Arc::clone(&cooldown),
            Arc::clone(&clock),
            connectivity.clone(),
            config.submit_timeout(),
        );
        let listener = MergeListener::new(
            event.event_id.clone(),
            feed,
            Arc::clone(&cooldown),
            Arc::clone(&matcher),
            config.echo_grace(),
            config.feed_reconnect_delay(),
            events.clone(),
        );
        let mode = ModeCoordinator::new(
            face_camera,
            qr_camera,
            config.initial_mode,
            config.mode_switch_grace(),
            config.capture_retry_delay(),
        );
        mode.start().await?;

        let mut initial_view = KioskView::new(config.initial_mode);
        initial_view.queue_length = submitter.queue_length().await?;
        let (view, _) = watch::channel(initial_view);

        tracing::info!(
            event = %event.event_id,
            mode = ?config.initial_mode,
            threshold = config.match_threshold,
            "kiosk session ready"
        );

        let shared = Arc::new(Shared {
            tracker: Mutex::new(Tracker::new(config.tracker_config())),
            config,
            event,
            clock,
            matcher,
            cooldown,
            submitter,
            listener,
            mode,
            detector,
            qr_decoder,
            roster,
            extractor,
            connectivity,
            busy: AtomicBool::new(false),
            last_code: Mutex::new(None),
            view,
            events,
        });

        Ok(Self {
            shared,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the polling loop, the drain worker and the merge listener.
    pub fn spawn_background(&self) {
        self.spawn_polling();
        self.spawn_drain_worker();
        self.spawn_merge_listener();
    }

    pub fn spawn_polling(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Attempt handles are detached; their outcome reaches the view.
                let _ = Shared::run_cycle(&shared).await;
            }
        });
        self.track(handle);
    }

    pub fn spawn_merge_listener(&self) {
        let shared = Arc::clone(&self.shared);
        self.track(tokio::spawn(async move { shared.listener.run().await }));
    }

    /// Drain on a fixed interval while online, and immediately whenever
    /// connectivity comes back.
    pub fn spawn_drain_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut online = shared.connectivity.clone();
            let mut ticker = tokio::time::interval(shared.config.drain_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut watching = true;

            loop {
                if watching {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        changed = online.changed() => {
                            if changed.is_err() {
                                tracing::debug!(
                                    "connectivity source gone; draining on interval only"
                                );
                                watching = false;
                                continue;
                            }
                            if *online.borrow_and_update() {
                                tracing::info!("connectivity restored; draining offline queue");
                            }
                        }
                    }
                } else {
                    ticker.tick().await;
                }

                if !*online.borrow_and_update() {
                    continue;
                }
                shared.drain_and_report().await;
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    /// Run one detection cycle against the active capture source.
    pub async fn run_cycle(&self) -> CycleReport {
        Shared::run_cycle(&self.shared).await
    }

    /// Live view for overlay and status rendering.
    pub fn subscribe(&self) -> watch::Receiver<KioskView> {
        self.shared.view.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<KioskEvent> {
        self.shared.events.subscribe()
    }

    pub fn view(&self) -> KioskView {
        self.shared.view.borrow().clone()
    }

    pub fn mode(&self) -> CaptureMode {
        self.shared.mode.current()
    }

    /// Hand the camera to the other capture mode.
    ///
    /// Tracking, duplicate-suppression and rejection holds are cleared
    /// during the switch.
    pub async fn switch_mode(&self, target: CaptureMode) -> Result<(), CheckinError> {
        let shared = &self.shared;
        let result = shared
            .mode
            .switch_to(target, || {
                shared.tracker().reset();
                shared.cooldown.clear_all_suppression();
                *shared.last_code.lock().unwrap_or_else(|e| e.into_inner()) = None;
            })
            .await;

        match &result {
            Ok(()) => shared.view.send_modify(|view| {
                *view = KioskView {
                    queue_length: view.queue_length,
                    ..KioskView::new(target)
                };
            }),
            Err(e) => {
                shared.emit(KioskEvent::OperatorError {
                    message: format!("camera unavailable: {e}"),
                });
                shared.view.send_modify(|view| view.state = ViewState::Error);
            }
        }
        result
    }

    /// Reload the roster and swap the descriptor index in place.
    pub async fn reload_roster(&self) -> Result<usize, CheckinError> {
        let shared = &self.shared;
        let matcher = load_matcher(
            shared.roster.as_ref(),
            shared.extractor.as_ref(),
            &shared.event.event_id,
            shared.clock.now(),
        )
        .await?;
        register_aliases(&shared.cooldown, &matcher);
        let enrolled = matcher.len();
        *shared.matcher.write().unwrap_or_else(|e| e.into_inner()) = matcher;
        shared.tracker().reset();
        Ok(enrolled)
    }

    /// Drain the offline queue now. `None` if a drain was already running.
    pub async fn drain_now(&self) -> Option<DrainReport> {
        self.shared.drain_and_report().await
    }

    pub async fn queue_length(&self) -> Result<usize, CheckinError> {
        self.shared.submitter.queue_length().await
    }

    pub fn queue(&self) -> &OfflineQueue {
        self.shared.submitter.queue()
    }

    pub fn cooldown(&self) -> &Arc<CooldownStore> {
        &self.shared.cooldown
    }

    pub fn merge_listener(&self) -> &MergeListener {
        &self.shared.listener
    }

    /// Stop background tasks and release the camera.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.shared.mode.stop().await;
        tracing::info!(event = %self.shared.event.event_id, "kiosk session stopped");
    }
}

impl Drop for KioskSession {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            task.abort();
        }
    }
}

fn register_aliases(cooldown: &CooldownStore, matcher: &DescriptorMatcher) {
    for (participant, account) in matcher.account_links() {
        cooldown.register_alias(participant, account);
    }
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: KioskEvent) {
        // No receivers just means no screen is attached.
        let _ = self.events.send(event);
    }

    async fn run_cycle(this: &Arc<Self>) -> CycleReport {
        let Some(guard) = BusyGuard::acquire(this) else {
            return CycleReport::Skipped;
        };

        let (mode, frame) = match this.mode.next_frame().await {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!(error = %e, "no frame this cycle");
                return CycleReport::NoFrame;
            }
        };

        match mode {
            CaptureMode::Face => Self::face_cycle(this, &frame, guard).await,
            CaptureMode::Qr => Self::qr_cycle(this, &frame, guard),
        }
    }

    async fn face_cycle(this: &Arc<Self>, frame: &Frame, guard: BusyGuard) -> CycleReport {
        let detections = match this.detector.detect_faces(frame).await {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                this.tracker().abandon(this.cooldown.as_ref());
                this.show_idle();
                return CycleReport::DetectionUnavailable;
            }
        };

        let observation = Observation {
            detections,
            frame_width: frame.width,
            frame_height: frame.height,
        };
        let now = this.clock.now();
        let signal = {
            let matcher = this.matcher.read().unwrap_or_else(|e| e.into_inner());
            this.tracker()
                .step(&observation, now, &matcher, this.cooldown.as_ref())
        };
        this.show_signal(&signal);

        match signal {
            Signal::Attempt { candidate } => {
                let request = AttemptRequest {
                    identity_id: candidate.identity_id,
                    display_name: candidate.display_name,
                    method: CheckinMethod::Face,
                    confidence: candidate.confidence,
                    captured_at: now,
                };
                CycleReport::Attempting(Self::spawn_attempt(this, request, guard))
            }
            Signal::AlreadyCheckedIn { candidate } => {
                this.emit(KioskEvent::AlreadyCheckedIn {
                    identity_id: candidate.identity_id.clone(),
                    display_name: candidate.display_name.clone(),
                });
                CycleReport::Face(Signal::AlreadyCheckedIn { candidate })
            }
            other => CycleReport::Face(other),
        }
    }

    fn qr_cycle(this: &Arc<Self>, frame: &Frame, guard: BusyGuard) -> CycleReport {
        let Some(raw) = this.qr_decoder.decode(frame) else {
            this.forget_code();
            this.show_idle();
            return CycleReport::Qr(QrOutcome::NoCode);
        };

        let resolved = parse_code(&raw).ok().and_then(|key| {
            let matcher = this.matcher.read().unwrap_or_else(|e| e.into_inner());
            matcher
                .resolve(&key)
                .map(|identity| (identity.id.clone(), identity.display_name.clone()))
        });

        let repeated = this.see_code(&raw, resolved.as_ref().map(|(id, _)| id.clone()));

        let Some((identity_id, display_name)) = resolved else {
            if !repeated {
                tracing::info!(code = %raw, "unrecognized code");
                this.emit(KioskEvent::UnknownCode { code: raw.clone() });
            }
            this.view.send_modify(|view| {
                view.state = ViewState::Error;
                view.candidate = None;
            });
            return CycleReport::Qr(QrOutcome::Unknown { code: raw });
        };

        let now = this.clock.now();
        if this.cooldown.mark_attempted(&identity_id, now) {
            // The success notice stands in for the duplicate notice while
            // the same code stays in view.
            this.cooldown.should_report_duplicate(&identity_id, now);
            this.view.send_modify(|view| {
                view.state = ViewState::Attempting;
                view.candidate = Some(display_name.clone());
                view.bounding_box = None;
                view.progress = 1.0;
            });
            let request = AttemptRequest {
                identity_id,
                display_name,
                method: CheckinMethod::Qr,
                confidence: 100.0,
                captured_at: now,
            };
            return CycleReport::Attempting(Self::spawn_attempt(this, request, guard));
        }

        if this.cooldown.is_rejected(&identity_id) {
            this.view.send_modify(|view| {
                view.state = ViewState::Error;
                view.candidate = Some(display_name);
            });
            return CycleReport::Qr(QrOutcome::Rejected { identity_id });
        }

        if this.cooldown.should_report_duplicate(&identity_id, now) {
            this.emit(KioskEvent::AlreadyCheckedIn {
                identity_id: identity_id.clone(),
                display_name: display_name.clone(),
            });
        }
        this.view.send_modify(|view| {
            view.state = ViewState::Duplicate;
            view.candidate = Some(display_name);
        });
        CycleReport::Qr(QrOutcome::AlreadyCheckedIn { identity_id })
    }

    /// Record `raw` as the code in view. Returns whether it was already there.
    fn see_code(&self, raw: &str, identity_id: Option<String>) -> bool {
        let mut last = self.last_code.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(seen) = last.as_ref() {
            if seen.raw == raw {
                return true;
            }
            if let Some(previous) = &seen.identity_id {
                self.cooldown.clear_suppression(previous);
                self.cooldown.clear_rejection(previous);
            }
        }
        *last = Some(SeenCode {
            raw: raw.to_string(),
            identity_id,
        });
        false
    }

    fn forget_code(&self) {
        let seen = self.last_code.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(identity_id) = seen.and_then(|s| s.identity_id) {
            self.cooldown.clear_suppression(&identity_id);
            self.cooldown.clear_rejection(&identity_id);
        }
    }

    fn spawn_attempt(
        this: &Arc<Self>,
        request: AttemptRequest,
        guard: BusyGuard,
    ) -> JoinHandle<Option<SubmitResolution>> {
        let shared = Arc::clone(this);
        tokio::spawn(async move {
            let _guard = guard;
            let resolution = shared.attempt(&request).await;
            shared.tracker().complete_attempt(shared.clock.now());
            shared.refresh_queue_length().await;
            resolution
        })
    }

    async fn attempt(&self, request: &AttemptRequest) -> Option<SubmitResolution> {
        let account_id = {
            let matcher = self.matcher.read().unwrap_or_else(|e| e.into_inner());
            matcher
                .identity(&request.identity_id)
                .and_then(|identity| identity.account_id.clone())
        };
        let payload = CheckinPayload::new(
            &self.event,
            request.identity_id.clone(),
            account_id,
            request.method,
            request.confidence,
            request.captured_at,
        );
        let status = payload.status;

        let resolution = match self.submitter.submit(payload).await {
            Ok(resolution) => resolution,
            Err(e) => {
                // Neither delivered nor persisted: release the entry so the
                // subject can try again.
                tracing::error!(
                    identity = %request.identity_id,
                    error = %e,
                    "check-in could not be recorded"
                );
                self.cooldown
                    .clear_attempt_at(&request.identity_id, request.captured_at);
                self.emit(KioskEvent::OperatorError {
                    message: format!("check-in for {} failed: {e}", request.display_name),
                });
                self.view.send_modify(|view| view.state = ViewState::Error);
                return None;
            }
        };

        match &resolution {
            SubmitResolution::Rejected { reason } => {
                tracing::error!(
                    identity = %request.identity_id,
                    reason = %reason,
                    "check-in rejected"
                );
                self.emit(KioskEvent::OperatorError {
                    message: format!("check-in for {} rejected: {reason}", request.display_name),
                });
                self.view.send_modify(|view| view.state = ViewState::Error);
            }
            other => {
                let queued = !matches!(other, SubmitResolution::Committed { .. });
                tracing::info!(
                    identity = %request.identity_id,
                    method = ?request.method,
                    ?status,
                    queued,
                    "checked in"
                );
                self.emit(KioskEvent::CheckedIn {
                    identity_id: request.identity_id.clone(),
                    display_name: request.display_name.clone(),
                    method: request.method,
                    status,
                    queued,
                });
                self.view.send_modify(|view| view.state = ViewState::Success);
            }
        }

        Some(resolution)
    }

    async fn drain_and_report(&self) -> Option<DrainReport> {
        let report = match self.submitter.drain().await {
            Ok(Some(report)) => report,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "offline queue drain failed");
                return None;
            }
        };

        for (item, reason) in &report.rejected {
            self.emit(KioskEvent::OperatorError {
                message: format!(
                    "queued check-in for {} rejected: {reason}",
                    item.identity_id
                ),
            });
        }
        if report.succeeded + report.failed > 0 {
            self.emit(KioskEvent::QueueDrained {
                succeeded: report.succeeded,
                failed: report.failed,
            });
        }
        self.refresh_queue_length().await;
        Some(report)
    }

    async fn refresh_queue_length(&self) {
        match self.submitter.queue_length().await {
            Ok(length) => self.view.send_modify(|view| view.queue_length = length),
            Err(e) => tracing::warn!(error = %e, "queue length unavailable"),
        }
    }

    fn show_idle(&self) {
        self.view.send_modify(|view| {
            view.state = ViewState::Idle;
            view.bounding_box = None;
            view.candidate = None;
            view.progress = 0.0;
        });
    }

    fn show_signal(&self, signal: &Signal) {
        let (state, candidate, progress) = match signal {
            Signal::Busy => return,
            Signal::NoFace
            | Signal::MultipleSubjects { .. }
            | Signal::TooFar { .. }
            | Signal::DetectionUnavailable
            | Signal::NoMatch => return self.show_idle(),
            Signal::Tracking { candidate, progress } => (ViewState::Tracking, candidate, *progress),
            Signal::Stable { candidate } => (ViewState::Stable, candidate, 1.0),
            Signal::AlreadyCheckedIn { candidate } => (ViewState::Duplicate, candidate, 1.0),
            Signal::Attempt { candidate } => (ViewState::Attempting, candidate, 1.0),
        };
        self.view.send_modify(|view| {
            view.state = state;
            view.bounding_box = Some(candidate.bounding_box);
            view.candidate = Some(candidate.display_name.clone());
            view.progress = progress;
        });
    }
}
