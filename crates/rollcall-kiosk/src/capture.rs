//! Capture resource abstraction shared by face and QR modes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("capture source not started")]
    NotStarted,
    #[error("capture interrupted by a mode switch")]
    Interrupted,
}

/// A captured camera frame, as handed to the detection and QR collaborators.
#[derive(Clone)]
pub struct Frame {
    /// Pixel data in whatever layout the capture source and its consumers agree on.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// A camera pipeline owned by one capture mode at a time.
///
/// `start` acquires the underlying device; `stop` must release it so the
/// other mode's pipeline can acquire the same camera.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), CaptureError>;

    async fn stop(&self);

    async fn next_frame(&self) -> Result<Frame, CaptureError>;
}
