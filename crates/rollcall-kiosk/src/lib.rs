//! rollcall-kiosk — Check-in terminal runtime.
//!
//! Drives a capture source through detection and stability tracking,
//! submits check-ins with an offline SQLite fallback, and merges records
//! created by other terminals from the realtime feed.

pub mod capture;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod mode;
pub mod queue;
pub mod realtime;
pub mod roster;
pub mod session;
pub mod submitter;

pub use capture::{CaptureError, CaptureSource, Frame};
pub use collaborators::{
    BackendError, CheckinBackend, CheckinFeed, Collaborators, DescriptorExtractor, DetectionError,
    FaceDetector, QrDecoder, RosterSource, SubmitOutcome, SubmitStatus,
};
pub use config::KioskConfig;
pub use error::CheckinError;
pub use events::{KioskEvent, KioskView, ViewState};
pub use mode::{CaptureMode, ModeCoordinator};
pub use queue::{DrainReport, OfflineQueue, PendingSubmission, QueueError};
pub use realtime::MergeListener;
pub use session::{CycleReport, KioskSession, QrOutcome};
pub use submitter::{SubmitResolution, Submitter};
