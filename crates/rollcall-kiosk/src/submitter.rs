//! Check-in submission: one synchronous attempt, falling back to the
//! offline queue, with the optimistic cooldown entry resolved from the
//! outcome.

use crate::collaborators::{BackendError, CheckinBackend, SubmitStatus};
use crate::error::CheckinError;
use crate::queue::{DrainReport, OfflineQueue};
use rollcall_core::{CheckinPayload, CheckinRecord, Clock, CooldownStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// How a submission ended, from the terminal's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResolution {
    /// The backend holds a record for this check-in.
    Committed {
        status: SubmitStatus,
        record: CheckinRecord,
    },
    /// Connectivity failure; the payload is in the offline queue.
    Queued { reason: String },
    /// No answer within the timeout. The payload is queued and the cooldown
    /// entry kept until a drain or a feed echo reconciles it.
    Ambiguous,
    /// The backend refused the payload. The optimistic entry was cleared
    /// and the identity held until it leaves view.
    Rejected { reason: String },
}

pub struct Submitter {
    backend: Arc<dyn CheckinBackend>,
    queue: OfflineQueue,
    cooldown: Arc<CooldownStore>,
    clock: Arc<dyn Clock>,
    online: watch::Receiver<bool>,
    timeout: Duration,
    drain_lock: Mutex<()>,
}

impl Submitter {
    pub fn new(
        backend: Arc<dyn CheckinBackend>,
        queue: OfflineQueue,
        cooldown: Arc<CooldownStore>,
        clock: Arc<dyn Clock>,
        online: watch::Receiver<bool>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            queue,
            cooldown,
            clock,
            online,
            timeout,
            drain_lock: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Submit a check-in whose cooldown entry was already written optimistically.
    pub async fn submit(
        &self,
        payload: CheckinPayload,
    ) -> Result<SubmitResolution, CheckinError> {
        let identity = payload.identity_id.clone();
        let result =
            tokio::time::timeout(self.timeout, self.backend.submit_checkin(&payload)).await;

        let resolution = match result {
            Ok(Ok(outcome)) => {
                // The feed echoes the record with the backend's commit time.
                self.cooldown
                    .mark_confirmed(&identity, outcome.record.submitted_at);
                SubmitResolution::Committed {
                    status: outcome.status,
                    record: outcome.record,
                }
            }
            Ok(Err(BackendError::Rejected(reason))) => {
                self.cooldown.clear_attempt_at(&identity, payload.captured_at);
                self.cooldown.mark_rejected(&identity);
                SubmitResolution::Rejected { reason }
            }
            Ok(Err(BackendError::Connectivity(reason))) => {
                tracing::warn!(
                    identity = %identity,
                    reason = %reason,
                    "backend unreachable; queueing check-in"
                );
                self.queue.enqueue(&payload, self.clock.now()).await?;
                SubmitResolution::Queued { reason }
            }
            Err(_) => {
                tracing::warn!(
                    identity = %identity,
                    timeout_secs = self.timeout.as_secs(),
                    "submission timed out; outcome unknown"
                );
                self.queue.enqueue(&payload, self.clock.now()).await?;
                SubmitResolution::Ambiguous
            }
        };

        Ok(resolution)
    }

    /// Replay the offline queue unless a drain is already running.
    ///
    /// Returns `None` when skipped.
    pub async fn drain(&self) -> Result<Option<DrainReport>, CheckinError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("drain already in progress; skipping");
            return Ok(None);
        };
        let report = self
            .queue
            .drain(self.backend.as_ref(), &self.cooldown, &self.online, self.timeout)
            .await?;
        Ok(Some(report))
    }

    pub async fn queue_length(&self) -> Result<usize, CheckinError> {
        Ok(self.queue.length().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SubmitOutcome;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rollcall_core::{CheckinMethod, EventContext, ManualClock, MergeOutcome, Resolution};

    #[derive(Clone, Copy)]
    enum Reply {
        Accept,
        Reject,
        Unreachable,
        Hang,
    }

    struct FixedBackend(Reply);

    fn commit_lag() -> chrono::Duration {
        chrono::Duration::seconds(40)
    }

    #[async_trait]
    impl CheckinBackend for FixedBackend {
        async fn submit_checkin(
            &self,
            payload: &CheckinPayload,
        ) -> Result<SubmitOutcome, BackendError> {
            match self.0 {
                Reply::Accept => Ok(SubmitOutcome {
                    status: SubmitStatus::Created,
                    record: CheckinRecord {
                        id: "rec-1".into(),
                        event_id: payload.event_id.clone(),
                        identity_id: payload.identity_id.clone(),
                        method: payload.method,
                        confidence: payload.confidence,
                        status: payload.status,
                        submitted_at: payload.captured_at + commit_lag(),
                    },
                }),
                Reply::Reject => Err(BackendError::Rejected("not enrolled".into())),
                Reply::Unreachable => Err(BackendError::Connectivity("dns".into())),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    async fn setup(reply: Reply) -> (Submitter, Arc<CooldownStore>, CheckinPayload) {
        let start = Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap();
        let event = EventContext {
            event_id: "ev".into(),
            starts_at: start,
            late_after: chrono::Duration::minutes(15),
        };
        let cooldown = Arc::new(CooldownStore::default());
        assert!(cooldown.mark_attempted("p1", start));
        let (_tx, online) = watch::channel(true);
        let submitter = Submitter::new(
            Arc::new(FixedBackend(reply)),
            OfflineQueue::in_memory().await.unwrap(),
            cooldown.clone(),
            Arc::new(ManualClock::new(start)),
            online,
            Duration::from_secs(8),
        );
        let payload = CheckinPayload::new(&event, "p1", None, CheckinMethod::Face, 91.0, start);
        (submitter, cooldown, payload)
    }

    #[tokio::test]
    async fn test_accepted_submission_confirms_entry() {
        let (submitter, cooldown, payload) = setup(Reply::Accept).await;
        let captured_at = payload.captured_at;
        let resolution = submitter.submit(payload).await.unwrap();
        assert!(matches!(
            resolution,
            SubmitResolution::Committed { status: SubmitStatus::Created, .. }
        ));
        let entry = cooldown.entry("p1").unwrap();
        assert_eq!(entry.resolution, Resolution::Confirmed);
        assert_eq!(entry.last_checkin_at, captured_at + commit_lag());
        assert_eq!(submitter.queue_length().await.unwrap(), 0);

        // The feed's copy of our own record is an echo.
        let outcome = cooldown.merge_remote(
            &["p1"],
            captured_at + commit_lag(),
            chrono::Duration::seconds(5),
        );
        assert_eq!(outcome, MergeOutcome::Echo);
    }

    #[tokio::test]
    async fn test_rejection_releases_entry_but_holds_identity() {
        let (submitter, cooldown, payload) = setup(Reply::Reject).await;
        let captured_at = payload.captured_at;
        let resolution = submitter.submit(payload).await.unwrap();
        assert_eq!(
            resolution,
            SubmitResolution::Rejected { reason: "not enrolled".into() }
        );
        assert!(cooldown.entry("p1").is_none());
        assert!(cooldown.is_rejected("p1"));
        assert!(!cooldown.mark_attempted("p1", captured_at + chrono::Duration::seconds(1)));
        assert_eq!(submitter.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connectivity_failure_queues_and_keeps_entry() {
        let (submitter, cooldown, payload) = setup(Reply::Unreachable).await;
        let resolution = submitter.submit(payload.clone()).await.unwrap();
        assert!(matches!(resolution, SubmitResolution::Queued { .. }));
        assert_eq!(cooldown.entry("p1").unwrap().resolution, Resolution::Attempted);

        let queued = submitter.queue().list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_ambiguous_and_queued() {
        let (submitter, cooldown, payload) = setup(Reply::Hang).await;
        let resolution = submitter.submit(payload).await.unwrap();
        assert_eq!(resolution, SubmitResolution::Ambiguous);
        assert!(cooldown.entry("p1").is_some());
        assert_eq!(submitter.queue_length().await.unwrap(), 1);
    }
}
