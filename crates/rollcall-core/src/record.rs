//! Check-in payloads and the record shapes exchanged with the backend.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinMethod {
    Face,
    Qr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinStatus {
    OnTime,
    Late,
}

/// The event check-ins are being collected for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub event_id: String,
    pub starts_at: DateTime<Utc>,
    /// Grace period after `starts_at` during which a check-in still counts as on time.
    #[serde(with = "duration_secs")]
    pub late_after: Duration,
}

impl EventContext {
    /// Attendance status for a subject captured at `captured_at`.
    pub fn status_at(&self, captured_at: DateTime<Utc>) -> CheckinStatus {
        if captured_at <= self.starts_at + self.late_after {
            CheckinStatus::OnTime
        } else {
            CheckinStatus::Late
        }
    }
}

/// What a terminal sends to the backend for one check-in.
///
/// `submission_id` is minted once per attempt and reused on every retry so
/// the backend can treat redelivery as a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinPayload {
    pub submission_id: Uuid,
    pub event_id: String,
    pub identity_id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    pub method: CheckinMethod,
    pub confidence: f32,
    pub status: CheckinStatus,
    pub captured_at: DateTime<Utc>,
}

impl CheckinPayload {
    pub fn new(
        event: &EventContext,
        identity_id: impl Into<String>,
        account_id: Option<String>,
        method: CheckinMethod,
        confidence: f32,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            submission_id: Uuid::new_v4(),
            event_id: event.event_id.clone(),
            identity_id: identity_id.into(),
            account_id,
            method,
            confidence,
            status: event.status_at(captured_at),
            captured_at,
        }
    }
}

/// A committed check-in as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinRecord {
    pub id: String,
    pub event_id: String,
    pub identity_id: String,
    pub method: CheckinMethod,
    pub confidence: f32,
    pub status: CheckinStatus,
    pub submitted_at: DateTime<Utc>,
}

/// A newly created record as announced on the realtime feed.
///
/// Depending on where the submission originated, the identity may be
/// referenced by its participant id, its account id, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub event_id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// One row from the roster collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub descriptor: Option<Vec<f32>>,
    #[serde(default)]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub enrolled_at: Option<DateTime<Utc>>,
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(d)?;
        Ok(Duration::seconds(secs))
    }
}
