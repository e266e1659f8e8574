use crate::capture::CaptureError;
use crate::collaborators::{BackendError, DetectionError};
use crate::queue::QueueError;
use thiserror::Error;

/// Errors surfaced by the kiosk engine.
///
/// Only [`CheckinError::PermanentRejection`] and an exhausted
/// [`CheckinError::ResourceBusy`] are meant for the operator; the rest are
/// logged and absorbed by the detection loop.
#[derive(Error, Debug)]
pub enum CheckinError {
    #[error("detection unavailable: {0}")]
    DetectionUnavailable(#[from] DetectionError),
    #[error("connectivity failure: {0}")]
    ConnectivityFailure(String),
    #[error("check-in rejected: {0}")]
    PermanentRejection(String),
    #[error("camera busy: {0}")]
    ResourceBusy(#[from] CaptureError),
    #[error("offline queue: {0}")]
    Queue(#[from] QueueError),
    #[error("roster unavailable: {0}")]
    Roster(BackendError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<BackendError> for CheckinError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Connectivity(msg) => CheckinError::ConnectivityFailure(msg),
            BackendError::Rejected(msg) => CheckinError::PermanentRejection(msg),
        }
    }
}
