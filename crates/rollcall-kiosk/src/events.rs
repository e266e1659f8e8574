//! What the kiosk screen observes: a continuously updated view and a stream
//! of discrete events.

use crate::mode::CaptureMode;
use rollcall_core::{BoundingBox, CheckinMethod, CheckinStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    Idle,
    Tracking,
    Stable,
    Attempting,
    Success,
    Duplicate,
    Error,
}

/// Snapshot of the terminal for overlay rendering and status indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KioskView {
    pub state: ViewState,
    pub mode: CaptureMode,
    pub bounding_box: Option<BoundingBox>,
    pub candidate: Option<String>,
    /// Fraction of the stability window held so far.
    pub progress: f32,
    pub queue_length: usize,
}

impl KioskView {
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            state: ViewState::Idle,
            mode,
            bounding_box: None,
            candidate: None,
            progress: 0.0,
            queue_length: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KioskEvent {
    CheckedIn {
        identity_id: String,
        display_name: String,
        method: CheckinMethod,
        status: CheckinStatus,
        /// Accepted locally but still waiting in the offline queue.
        queued: bool,
    },
    AlreadyCheckedIn {
        identity_id: String,
        display_name: String,
    },
    RemoteCheckin {
        identity_id: String,
        display_name: String,
    },
    UnknownCode {
        code: String,
    },
    QueueDrained {
        succeeded: usize,
        failed: usize,
    },
    /// Needs operator attention: permanent rejection or camera unavailable.
    OperatorError {
        message: String,
    },
}
