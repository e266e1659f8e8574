//! In-process stand-ins for the kiosk's collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rollcall_core::{
    BoundingBox, CheckinPayload, CheckinRecord, Descriptor, Detection, FeedEvent,
    ManualClock, RosterEntry,
};
use rollcall_kiosk::{
    BackendError, CaptureError, CaptureSource, CheckinBackend, CheckinFeed, Collaborators,
    DescriptorExtractor, DetectionError, FaceDetector, Frame, KioskConfig, KioskSession,
    OfflineQueue, QrDecoder, RosterSource, SubmitOutcome, SubmitStatus,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};

pub const DIM: usize = 128;
pub const EVENT_ID: &str = "assembly-2026-09-01";

/// How long after capture the backend stamps a record, unless overridden.
pub const DEFAULT_COMMIT_LAG_MS: i64 = 1_000;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap()
}

/// Unit vector along `axis`.
pub fn unit(axis: usize) -> Vec<f32> {
    let mut values = vec![0.0; DIM];
    values[axis] = 1.0;
    values
}

/// A descriptor at Euclidean distance `offset` from `unit(axis)`.
pub fn near(axis: usize, offset: f32) -> Descriptor {
    let mut values = unit(axis);
    values[(axis + 1) % DIM] = offset;
    Descriptor::new(values)
}

/// A close, well-framed face carrying `descriptor`.
pub fn face(descriptor: Descriptor) -> Detection {
    Detection {
        bounding_box: BoundingBox {
            x: 160.0,
            y: 80.0,
            width: 320.0,
            height: 320.0,
        },
        descriptor: Some(descriptor),
        score: 0.98,
    }
}

pub fn roster_entry(id: &str, name: &str, axis: usize, account: Option<&str>) -> RosterEntry {
    RosterEntry {
        id: id.into(),
        display_name: name.into(),
        account_id: account.map(String::from),
        descriptor: Some(unit(axis)),
        photo_ref: None,
        enrolled_at: Some(start_time() - chrono::Duration::days(30)),
    }
}

/// Idempotent per `(event, identity)`, like the real backend.
pub struct StubBackend {
    records: Mutex<HashMap<(String, String), CheckinRecord>>,
    calls: AtomicUsize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<FeedEvent>>>,
    published: Mutex<Vec<FeedEvent>>,
    commit_lag_ms: AtomicI64,
    rejecting: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            records: Mutex::default(),
            calls: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            subscribers: Mutex::default(),
            published: Mutex::default(),
            commit_lag_ms: AtomicI64::new(DEFAULT_COMMIT_LAG_MS),
            rejecting: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }
}

impl StubBackend {
    /// Stamp new records `lag` after their capture time.
    pub fn set_commit_lag(&self, lag: chrono::Duration) {
        self.commit_lag_ms.store(lag.num_milliseconds(), Ordering::SeqCst);
    }

    /// Refuse every submission outright while set.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Park each submission until the returned handle is notified once.
    pub fn hold_submissions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn has_record(&self, identity_id: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .contains_key(&(EVENT_ID.to_string(), identity_id.to_string()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Everything the realtime feed has carried so far.
    pub fn published(&self) -> Vec<FeedEvent> {
        self.published.lock().unwrap().clone()
    }

    fn commit(&self, payload: &CheckinPayload) -> SubmitOutcome {
        let key = (payload.event_id.clone(), payload.identity_id.clone());
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(&key) {
            return SubmitOutcome {
                status: SubmitStatus::AlreadyExists,
                record: existing.clone(),
            };
        }

        let committed_at = payload.captured_at
            + chrono::Duration::milliseconds(self.commit_lag_ms.load(Ordering::SeqCst));
        let record = CheckinRecord {
            id: format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            event_id: payload.event_id.clone(),
            identity_id: payload.identity_id.clone(),
            method: payload.method,
            confidence: payload.confidence,
            status: payload.status,
            submitted_at: committed_at,
        };
        records.insert(key, record.clone());
        drop(records);

        let event = FeedEvent {
            event_id: payload.event_id.clone(),
            participant_id: Some(payload.identity_id.clone()),
            account_id: payload.account_id.clone(),
            submitted_at: committed_at,
        };
        self.published.lock().unwrap().push(event.clone());
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.try_send(event.clone()).is_ok());

        SubmitOutcome {
            status: SubmitStatus::Created,
            record,
        }
    }
}

/// One terminal's network path to the shared backend.
pub struct Link {
    backend: Arc<StubBackend>,
    up: AtomicBool,
    status: watch::Sender<bool>,
}

impl Link {
    pub fn new(backend: Arc<StubBackend>, up: bool) -> Arc<Self> {
        let (status, _) = watch::channel(up);
        Arc::new(Self {
            backend,
            up: AtomicBool::new(up),
            status,
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
        self.status.send_replace(up);
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }
}

#[async_trait]
impl CheckinBackend for Link {
    async fn submit_checkin(
        &self,
        payload: &CheckinPayload,
    ) -> Result<SubmitOutcome, BackendError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(BackendError::Connectivity("network unreachable".into()));
        }
        self.backend.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.backend.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if payload.event_id != EVENT_ID {
            return Err(BackendError::Rejected(format!(
                "unknown event {}",
                payload.event_id
            )));
        }
        if self.backend.rejecting.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected("participant not registered".into()));
        }
        Ok(self.backend.commit(payload))
    }
}

#[async_trait]
impl CheckinFeed for Link {
    async fn subscribe(
        &self,
        _event_id: &str,
    ) -> Result<mpsc::Receiver<FeedEvent>, BackendError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(BackendError::Connectivity("network unreachable".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.backend.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Returns whatever detections the test last put in front of the camera.
#[derive(Default)]
pub struct ScriptedDetector {
    current: Mutex<Vec<Detection>>,
    failing: AtomicBool,
}

impl ScriptedDetector {
    pub fn show(&self, detections: Vec<Detection>) {
        *self.current.lock().unwrap() = detections;
    }

    pub fn clear(&self) {
        self.show(Vec::new());
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    async fn detect_faces(
        &self,
        _frame: &Frame,
    ) -> Result<Vec<Detection>, DetectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DetectionError("model not loaded".into()));
        }
        Ok(self.current.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct ScriptedQr {
    current: Mutex<Option<String>>,
}

impl ScriptedQr {
    pub fn show(&self, code: &str) {
        *self.current.lock().unwrap() = Some(code.to_string());
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }
}

impl QrDecoder for ScriptedQr {
    fn decode(&self, _frame: &Frame) -> Option<String> {
        self.current.lock().unwrap().clone()
    }
}

pub struct FakeCamera {
    name: &'static str,
    running: AtomicBool,
    sequence: AtomicU64,
}

impl FakeCamera {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            running: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSource for FakeCamera {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self) -> Result<(), CaptureError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn next_frame(&self) -> Result<Frame, CaptureError> {
        if !self.is_running() {
            return Err(CaptureError::NotStarted);
        }
        Ok(Frame {
            data: vec![0; 16],
            width: 640,
            height: 480,
            captured_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// A roster the test can rewrite between reloads.
pub struct StubRoster(Mutex<Vec<RosterEntry>>);

impl StubRoster {
    pub fn new(entries: Vec<RosterEntry>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(entries)))
    }

    pub fn enroll(&self, entry: RosterEntry) {
        self.0.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl RosterSource for StubRoster {
    async fn list_enrollable_identities(
        &self,
        _event_id: &str,
    ) -> Result<Vec<RosterEntry>, BackendError> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn fetch_photo(&self, photo_ref: &str) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Connectivity(format!("no photo {photo_ref}")))
    }
}

pub struct NoExtractor;

#[async_trait]
impl DescriptorExtractor for NoExtractor {
    async fn extract_descriptor(
        &self,
        _image: &[u8],
    ) -> Result<Option<Descriptor>, DetectionError> {
        Ok(None)
    }
}

/// One terminal plus the handles a test needs to drive it.
pub struct Terminal {
    pub session: KioskSession,
    pub clock: Arc<ManualClock>,
    pub detector: Arc<ScriptedDetector>,
    pub qr: Arc<ScriptedQr>,
    pub roster: Arc<StubRoster>,
    pub link: Arc<Link>,
    pub face_camera: Arc<FakeCamera>,
    pub qr_camera: Arc<FakeCamera>,
}

impl Terminal {
    pub async fn new(backend: Arc<StubBackend>, roster: Vec<RosterEntry>) -> Self {
        Self::with_link(Link::new(backend, true), roster).await
    }

    pub async fn with_link(link: Arc<Link>, roster: Vec<RosterEntry>) -> Self {
        Self::build(link, roster, None).await
    }

    /// A terminal built through [`KioskSession::start`], with its polling
    /// loop, drain worker and merge listener running against `queue_db`.
    pub async fn started(link: Arc<Link>, roster: Vec<RosterEntry>, queue_db: &Path) -> Self {
        Self::build(link, roster, Some(queue_db)).await
    }

    async fn build(link: Arc<Link>, roster: Vec<RosterEntry>, queue_db: Option<&Path>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let detector = Arc::new(ScriptedDetector::default());
        let qr = Arc::new(ScriptedQr::default());
        let roster = StubRoster::new(roster);
        let face_camera = FakeCamera::new("face");
        let qr_camera = FakeCamera::new("qr");

        let collaborators = Collaborators {
            roster: roster.clone(),
            extractor: Arc::new(NoExtractor),
            detector: detector.clone(),
            qr_decoder: qr.clone(),
            backend: link.clone(),
            feed: link.clone(),
            face_camera: face_camera.clone(),
            qr_camera: qr_camera.clone(),
            connectivity: link.connectivity(),
        };

        let mut config = KioskConfig {
            mode_switch_grace_ms: 0,
            capture_retry_delay_ms: 0,
            poll_interval_ms: 10,
            feed_reconnect_delay_ms: 50,
            ..KioskConfig::default()
        };
        let event = config.event_context(EVENT_ID, start_time());
        let session = match queue_db {
            Some(path) => {
                config.queue_db_path = path.to_path_buf();
                KioskSession::start(config, event, collaborators, clock.clone()).await
            }
            None => {
                let queue = OfflineQueue::in_memory().await.unwrap();
                KioskSession::with_queue(config, event, collaborators, clock.clone(), queue).await
            }
        }
        .unwrap();

        Self {
            session,
            clock,
            detector,
            qr,
            roster,
            link,
            face_camera,
            qr_camera,
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.clock.advance(chrono::Duration::milliseconds(ms));
    }

    pub fn now(&self) -> DateTime<Utc> {
        rollcall_core::Clock::now(self.clock.as_ref())
    }
}
