//! Detection and stability tracking.
//!
//! Converts per-frame face detections into a single candidate identity that
//! has been held stable for a minimum window, then hands it to the cooldown
//! gate. The transition logic is a pure function over [`TrackerState`]; the
//! [`Tracker`] wrapper only stores the current state.
//!
//! ```text
//! Idle ──match──▶ Tracking ──window elapsed──▶ Stable ──gate granted──▶ Attempting
//!  ▲                 │   ▲                          │                        │
//!  │                 │   └───── complete, fresh window ─────────────────────┘
//!  └── no face / too far / >1 face ──────────────────┘
//! ```

use crate::matcher::DescriptorMatcher;
use crate::types::{BoundingBox, Detection};
use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_STABILITY_WINDOW_MS: i64 = 600;
pub const DEFAULT_MIN_FACE_RATIO: f32 = 0.2;
pub const DEFAULT_MATCH_THRESHOLD: f32 = 50.0;

/// Cooldown decisions the tracker needs when a candidate becomes stable.
pub trait EligibilityGate {
    /// Atomically check eligibility and reserve the attempt.
    fn try_acquire(&self, identity_id: &str, now: DateTime<Utc>) -> bool;
    /// Whether an "already checked in" notice should be surfaced right now.
    fn report_duplicate(&self, identity_id: &str, now: DateTime<Utc>) -> bool;
    /// The stability session for this identity has ended.
    fn end_session(&self, identity_id: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub match_threshold: f32,
    pub min_face_ratio: f32,
    pub stability_window: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            min_face_ratio: DEFAULT_MIN_FACE_RATIO,
            stability_window: Duration::milliseconds(DEFAULT_STABILITY_WINDOW_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedCandidate {
    pub identity_id: String,
    pub display_name: String,
    pub confidence: f32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub bounding_box: BoundingBox,
}

impl TrackedCandidate {
    /// Fraction of the stability window already elapsed, in [0, 1].
    pub fn progress(&self, window: Duration) -> f32 {
        if window <= Duration::zero() {
            return 1.0;
        }
        let held = (self.last_seen_at - self.first_seen_at).num_milliseconds() as f32;
        (held / window.num_milliseconds() as f32).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum TrackerState {
    #[default]
    Idle,
    Tracking(TrackedCandidate),
    Stable(TrackedCandidate),
    Attempting(TrackedCandidate),
}

impl TrackerState {
    pub fn candidate(&self) -> Option<&TrackedCandidate> {
        match self {
            TrackerState::Idle => None,
            TrackerState::Tracking(c) | TrackerState::Stable(c) | TrackerState::Attempting(c) => {
                Some(c)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackerState::Idle => "idle",
            TrackerState::Tracking(_) => "tracking",
            TrackerState::Stable(_) => "stable",
            TrackerState::Attempting(_) => "attempting",
        }
    }
}

/// Everything the detector reported for one frame.
#[derive(Debug, Clone)]
pub struct Observation {
    pub detections: Vec<Detection>,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// What a detection cycle surfaces to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    NoFace,
    MultipleSubjects { count: usize },
    TooFar { ratio: f32 },
    /// The detection had no descriptor.
    DetectionUnavailable,
    NoMatch,
    Tracking { candidate: TrackedCandidate, progress: f32 },
    /// Stable but cooling down; the duplicate notice was already shown.
    Stable { candidate: TrackedCandidate },
    AlreadyCheckedIn { candidate: TrackedCandidate },
    /// Gate granted: the caller must submit and then call [`Tracker::complete_attempt`].
    Attempt { candidate: TrackedCandidate },
    /// An attempt is in flight; the observation was ignored.
    Busy,
}

/// Inputs to [`transition`] besides the state and observation.
pub struct StepContext<'a> {
    pub config: &'a TrackerConfig,
    pub matcher: &'a DescriptorMatcher,
    pub gate: &'a dyn EligibilityGate,
}

/// Compute the next tracker state for one detection cycle.
pub fn transition(
    state: &TrackerState,
    observation: &Observation,
    now: DateTime<Utc>,
    ctx: &StepContext<'_>,
) -> (TrackerState, Signal) {
    if let TrackerState::Attempting(_) = state {
        return (state.clone(), Signal::Busy);
    }

    let detection = match observation.detections.len() {
        0 => return reset(state, ctx, Signal::NoFace),
        1 => &observation.detections[0],
        // Single-subject policy: never progress with more than one face in view.
        count => return reset(state, ctx, Signal::MultipleSubjects { count }),
    };

    let ratio = detection
        .bounding_box
        .size_ratio(observation.frame_width, observation.frame_height);
    if ratio < ctx.config.min_face_ratio {
        return reset(state, ctx, Signal::TooFar { ratio });
    }

    let Some(descriptor) = detection.descriptor.as_ref() else {
        return reset(state, ctx, Signal::DetectionUnavailable);
    };

    let Some(found) = ctx.matcher.find_match(descriptor, ctx.config.match_threshold) else {
        return reset(state, ctx, Signal::NoMatch);
    };

    let candidate = match state.candidate() {
        Some(prev) if prev.identity_id == found.identity_id => TrackedCandidate {
            confidence: found.confidence,
            last_seen_at: now,
            bounding_box: detection.bounding_box,
            ..prev.clone()
        },
        prev => {
            if let Some(prev) = prev {
                tracing::debug!(
                    from = %prev.identity_id,
                    to = %found.identity_id,
                    "candidate changed; restarting stability window"
                );
                ctx.gate.end_session(&prev.identity_id);
            }
            TrackedCandidate {
                identity_id: found.identity_id,
                display_name: found.display_name,
                confidence: found.confidence,
                first_seen_at: now,
                last_seen_at: now,
                bounding_box: detection.bounding_box,
            }
        }
    };

    if now - candidate.first_seen_at < ctx.config.stability_window {
        let progress = candidate.progress(ctx.config.stability_window);
        return (
            TrackerState::Tracking(candidate.clone()),
            Signal::Tracking { candidate, progress },
        );
    }

    if ctx.gate.try_acquire(&candidate.identity_id, now) {
        tracing::info!(
            identity = %candidate.identity_id,
            confidence = candidate.confidence,
            "candidate stable; attempting check-in"
        );
        return (
            TrackerState::Attempting(candidate.clone()),
            Signal::Attempt { candidate },
        );
    }

    let signal = if ctx.gate.report_duplicate(&candidate.identity_id, now) {
        Signal::AlreadyCheckedIn { candidate: candidate.clone() }
    } else {
        Signal::Stable { candidate: candidate.clone() }
    };
    (TrackerState::Stable(candidate), signal)
}

fn reset(state: &TrackerState, ctx: &StepContext<'_>, signal: Signal) -> (TrackerState, Signal) {
    if let Some(prev) = state.candidate() {
        ctx.gate.end_session(&prev.identity_id);
    }
    (TrackerState::Idle, signal)
}

/// Holder for the current tracker state.
#[derive(Debug, Default)]
pub struct Tracker {
    config: TrackerConfig,
    state: TrackerState,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: TrackerState::Idle,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn step(
        &mut self,
        observation: &Observation,
        now: DateTime<Utc>,
        matcher: &DescriptorMatcher,
        gate: &dyn EligibilityGate,
    ) -> Signal {
        let ctx = StepContext {
            config: &self.config,
            matcher,
            gate,
        };
        let (next, signal) = transition(&self.state, observation, now, &ctx);
        if next.name() != self.state.name() {
            tracing::trace!(from = self.state.name(), to = next.name(), "tracker transition");
        }
        self.state = next;
        signal
    }

    /// Leave `Attempting` once the submission has resolved, whatever the outcome.
    ///
    /// The candidate stays tracked with a fresh stability window, so its
    /// session only ends when it leaves view. No-op in any other state (a
    /// mode switch may already have reset us).
    pub fn complete_attempt(&mut self, now: DateTime<Utc>) {
        if let TrackerState::Attempting(candidate) = &self.state {
            self.state = TrackerState::Tracking(TrackedCandidate {
                first_seen_at: now,
                last_seen_at: now,
                ..candidate.clone()
            });
        }
    }

    /// Drop the current candidate after a failed cycle, ending its stability session.
    pub fn abandon(&mut self, gate: &dyn EligibilityGate) {
        if let TrackerState::Attempting(_) = self.state {
            return;
        }
        if let Some(candidate) = self.state.candidate() {
            gate.end_session(&candidate.identity_id);
        }
        self.state = TrackerState::Idle;
    }

    /// Drop any candidate without touching cooldowns (mode switch, teardown).
    pub fn reset(&mut self) {
        self.state = TrackerState::Idle;
    }
}
