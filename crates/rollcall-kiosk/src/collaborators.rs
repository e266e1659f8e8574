//! Interfaces to the services the engine depends on but does not implement:
//! face detection, descriptor extraction, QR decoding, the roster, the
//! check-in backend and its realtime feed.

use crate::capture::{CaptureSource, Frame};
use async_trait::async_trait;
use rollcall_core::{CheckinPayload, CheckinRecord, Descriptor, Detection, FeedEvent, RosterEntry};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("detection unavailable: {0}")]
pub struct DetectionError(pub String);

/// Failure modes reported by the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request may not have reached the backend; safe to retry later.
    #[error("connectivity failure: {0}")]
    Connectivity(String),
    /// The backend refused the payload; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BackendError::Connectivity(_))
    }
}

/// Whether a submission created a record or found one already committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    pub record: CheckinRecord,
}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;
}

#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    /// Extract a descriptor from an enrollment photo, if a face is found.
    async fn extract_descriptor(&self, image: &[u8]) -> Result<Option<Descriptor>, DetectionError>;
}

pub trait QrDecoder: Send + Sync {
    fn decode(&self, frame: &Frame) -> Option<String>;
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn list_enrollable_identities(&self, event_id: &str)
        -> Result<Vec<RosterEntry>, BackendError>;

    async fn fetch_photo(&self, photo_ref: &str) -> Result<Vec<u8>, BackendError>;
}

/// Persistence API for check-in records.
///
/// Implementations must be idempotent per `(event_id, identity_id)`:
/// resubmitting for an identity that already has a committed record returns
/// [`SubmitStatus::AlreadyExists`] rather than an error.
#[async_trait]
pub trait CheckinBackend: Send + Sync {
    async fn submit_checkin(&self, payload: &CheckinPayload) -> Result<SubmitOutcome, BackendError>;
}

#[async_trait]
pub trait CheckinFeed: Send + Sync {
    /// Subscribe to records created for `event_id` by any terminal.
    ///
    /// The subscription ends when the returned channel closes.
    async fn subscribe(&self, event_id: &str) -> Result<mpsc::Receiver<FeedEvent>, BackendError>;
}

/// Everything a kiosk session needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub roster: Arc<dyn RosterSource>,
    pub extractor: Arc<dyn DescriptorExtractor>,
    pub detector: Arc<dyn FaceDetector>,
    pub qr_decoder: Arc<dyn QrDecoder>,
    pub backend: Arc<dyn CheckinBackend>,
    pub feed: Arc<dyn CheckinFeed>,
    pub face_camera: Arc<dyn CaptureSource>,
    pub qr_camera: Arc<dyn CaptureSource>,
    /// `true` while the terminal believes it is online.
    pub connectivity: watch::Receiver<bool>,
}
