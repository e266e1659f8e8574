//! rollcall-core — Identity matching and check-in deduplication.
//!
//! Holds the parts of the kiosk check-in engine that do not touch I/O:
//! the descriptor matcher, the detection/stability tracker, the cooldown
//! store and QR key parsing.

pub mod clock;
pub mod cooldown;
pub mod matcher;
pub mod qr;
pub mod record;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::{CooldownEntry, CooldownStore, MergeOutcome, Resolution};
pub use matcher::{confidence_for_distance, DescriptorMatcher};
pub use qr::{parse_code, QrError, QrKey};
pub use record::{
    CheckinMethod, CheckinPayload, CheckinRecord, CheckinStatus, EventContext, FeedEvent,
    RosterEntry,
};
pub use tracker::{
    EligibilityGate, Observation, Signal, TrackedCandidate, Tracker, TrackerConfig, TrackerState,
};
pub use types::{BoundingBox, Descriptor, Detection, EnrolledIdentity, IdentityMatch};
