//! Durable FIFO of check-in submissions that could not reach the backend.
//!
//! Entries live in SQLite so they survive restarts. An entry is deleted only
//! after the backend confirmed it (`created` / `already_exists`) or rejected
//! it outright; a cancelled drain therefore never loses work.

use crate::collaborators::{BackendError, CheckinBackend, SubmitStatus};
use chrono::{DateTime, Utc};
use rollcall_core::{CheckinPayload, CooldownStore};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const QUEUE_SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS pending_submissions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        identity_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        enqueued_at TEXT NOT NULL,
        last_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_pending_event ON pending_submissions(event_id);
";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt queue entry {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// One queued submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
    pub id: Uuid,
    pub identity_id: String,
    pub event_id: String,
    pub payload: CheckinPayload,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Entries the backend refused; already removed from the queue.
    pub rejected: Vec<(PendingSubmission, String)>,
    /// Payloads committed during this pass, in drain order.
    pub committed: Vec<CheckinPayload>,
    /// The pass ended early because connectivity was lost.
    pub stopped_offline: bool,
}

struct RawRow {
    id: String,
    identity_id: String,
    event_id: String,
    payload_json: String,
    attempt_count: i64,
    enqueued_at: String,
    last_error: Option<String>,
}

impl RawRow {
    fn into_pending(self) -> Result<PendingSubmission, QueueError> {
        let corrupt = |reason: String| QueueError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let payload: CheckinPayload =
            serde_json::from_str(&self.payload_json).map_err(|e| corrupt(e.to_string()))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        Ok(PendingSubmission {
            id,
            identity_id: self.identity_id,
            event_id: self.event_id,
            payload,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(u32::MAX),
            enqueued_at,
            last_error: self.last_error,
        })
    }
}

/// SQLite-backed offline submission queue.
#[derive(Clone)]
pub struct OfflineQueue {
    conn: Connection,
}

impl OfflineQueue {
    /// Open or create the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// An in-memory queue, for tests and diagnostics.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.call(|conn| {
            conn.execute_batch(QUEUE_SCHEMA_SQL)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Append a payload. Returns `false` if the same submission is already queued.
    pub async fn enqueue(
        &self,
        payload: &CheckinPayload,
        at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let json = serde_json::to_string(payload).map_err(|e| QueueError::Corrupt {
            id: payload.submission_id.to_string(),
            reason: e.to_string(),
        })?;
        let id = payload.submission_id.to_string();
        let identity_id = payload.identity_id.clone();
        let event_id = payload.event_id.clone();
        let enqueued_at = at.to_rfc3339();

        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO pending_submissions
                     (id, identity_id, event_id, payload_json, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, identity_id, event_id, json, enqueued_at],
                )?;
                Ok(n)
            })
            .await?;

        if inserted > 0 {
            tracing::info!(
                submission = %payload.submission_id,
                identity = %payload.identity_id,
                "check-in queued for later delivery"
            );
        }
        Ok(inserted > 0)
    }

    pub async fn length(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .conn
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM pending_submissions", [], |row| {
                    row.get(0)
                })?;
                Ok(n)
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// All queued entries in FIFO order.
    pub async fn list(&self) -> Result<Vec<PendingSubmission>, QueueError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, event_id, payload_json, attempt_count,
                            enqueued_at, last_error
                     FROM pending_submissions ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(RawRow {
                            id: row.get(0)?,
                            identity_id: row.get(1)?,
                            event_id: row.get(2)?,
                            payload_json: row.get(3)?,
                            attempt_count: row.get(4)?,
                            enqueued_at: row.get(5)?,
                            last_error: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(RawRow::into_pending).collect()
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool, QueueError> {
        let id = id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM pending_submissions WHERE id = ?1", [id])?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        let error = error.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_submissions
                     SET attempt_count = attempt_count + 1, last_error = ?2
                     WHERE id = ?1",
                    rusqlite::params![id, error],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Replay queued submissions in FIFO order, one at a time.
    ///
    /// - confirmed (`created` / `already_exists`): removed, cooldown confirmed
    ///   at the record's commit time
    /// - rejected: removed, its own optimistic cooldown entry cleared, pass stops
    /// - connectivity failure or timeout: kept with its attempt count bumped;
    ///   the pass moves on unless `online` now reports offline
    pub async fn drain(
        &self,
        backend: &dyn CheckinBackend,
        cooldown: &CooldownStore,
        online: &watch::Receiver<bool>,
        submit_timeout: Duration,
    ) -> Result<DrainReport, QueueError> {
        let pending = self.list().await?;
        let mut report = DrainReport::default();

        if pending.is_empty() {
            return Ok(report);
        }
        tracing::debug!(count = pending.len(), "draining offline queue");

        for item in pending {
            let result =
                tokio::time::timeout(submit_timeout, backend.submit_checkin(&item.payload)).await;

            match result {
                Ok(Ok(outcome)) => {
                    self.remove(item.id).await?;
                    cooldown.mark_confirmed(&item.identity_id, outcome.record.submitted_at);
                    if outcome.status == SubmitStatus::AlreadyExists {
                        tracing::debug!(
                            submission = %item.id,
                            "queued check-in already committed"
                        );
                    }
                    report.succeeded += 1;
                    report.committed.push(item.payload);
                }
                Ok(Err(BackendError::Rejected(reason))) => {
                    tracing::warn!(
                        submission = %item.id,
                        identity = %item.identity_id,
                        reason = %reason,
                        "queued check-in rejected; stopping drain"
                    );
                    self.remove(item.id).await?;
                    cooldown.clear_attempt_at(&item.identity_id, item.payload.captured_at);
                    report.failed += 1;
                    report.rejected.push((item, reason));
                    break;
                }
                Ok(Err(BackendError::Connectivity(reason))) => {
                    self.record_failure(item.id, &reason).await?;
                    report.failed += 1;
                    if !*online.borrow() {
                        report.stopped_offline = true;
                        break;
                    }
                }
                Err(_) => {
                    self.record_failure(item.id, "submission timed out").await?;
                    report.failed += 1;
                    if !*online.borrow() {
                        report.stopped_offline = true;
                        break;
                    }
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "offline queue drain finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SubmitOutcome;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rollcall_core::{CheckinMethod, CheckinRecord, EventContext, MergeOutcome, Resolution};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn event() -> EventContext {
        EventContext {
            event_id: "ev".into(),
            starts_at: Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap(),
            late_after: chrono::Duration::minutes(15),
        }
    }

    /// Queued submissions reach the backend long after capture.
    fn commit_lag() -> chrono::Duration {
        chrono::Duration::minutes(10)
    }

    fn payload(identity: &str) -> CheckinPayload {
        let ev = event();
        CheckinPayload::new(&ev, identity, None, CheckinMethod::Face, 90.0, ev.starts_at)
    }

    /// Answers submissions from a script, recording the order they arrive in.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<SubmitStatus, BackendError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<SubmitStatus, BackendError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CheckinBackend for ScriptedBackend {
        async fn submit_checkin(
            &self,
            payload: &CheckinPayload,
        ) -> Result<SubmitOutcome, BackendError> {
            self.seen.lock().unwrap().push(payload.identity_id.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(SubmitStatus::Created));
            next.map(|status| SubmitOutcome {
                status,
                record: CheckinRecord {
                    id: payload.submission_id.to_string(),
                    event_id: payload.event_id.clone(),
                    identity_id: payload.identity_id.clone(),
                    method: payload.method,
                    confidence: payload.confidence,
                    status: payload.status,
                    submitted_at: payload.captured_at + commit_lag(),
                },
            })
        }
    }

    fn online(value: bool) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(value);
        // Keep the value readable after the sender is gone.
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn test_enqueue_is_fifo_and_deduplicated() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let (a, b) = (payload("a"), payload("b"));
        let now = Utc::now();

        assert!(queue.enqueue(&a, now).await.unwrap());
        assert!(queue.enqueue(&b, now).await.unwrap());
        assert!(!queue.enqueue(&a, now).await.unwrap());

        let items = queue.list().await.unwrap();
        assert_eq!(queue.length().await.unwrap(), 2);
        assert_eq!(items[0].payload, a);
        assert_eq!(items[1].payload, b);
        assert_eq!(items[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/queue.db");
        let p = payload("a");
        {
            let queue = OfflineQueue::open(&path).await.unwrap();
            queue.enqueue(&p, Utc::now()).await.unwrap();
        }
        let reopened = OfflineQueue::open(&path).await.unwrap();
        let items = reopened.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, p);
    }

    #[tokio::test]
    async fn test_drain_success_removes_and_confirms() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let cooldown = CooldownStore::default();
        for id in ["a", "b", "c"] {
            queue.enqueue(&payload(id), Utc::now()).await.unwrap();
        }
        let backend = ScriptedBackend::new(vec![
            Ok(SubmitStatus::Created),
            Ok(SubmitStatus::AlreadyExists),
            Ok(SubmitStatus::Created),
        ]);

        let report = queue
            .drain(&backend, &cooldown, &online(true), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!((report.succeeded, report.failed), (3, 0));
        assert_eq!(*backend.seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(queue.length().await.unwrap(), 0);
        assert!(!cooldown.is_eligible("b", event().starts_at));
    }

    #[tokio::test]
    async fn test_drain_stops_on_rejection() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let cooldown = CooldownStore::default();
        for id in ["a", "b", "c"] {
            queue.enqueue(&payload(id), Utc::now()).await.unwrap();
        }
        cooldown.mark_attempted("b", event().starts_at);
        let backend = ScriptedBackend::new(vec![
            Ok(SubmitStatus::Created),
            Err(BackendError::Rejected("unknown participant".into())),
        ]);

        let report = queue
            .drain(&backend, &cooldown, &online(true), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0.identity_id, "b");
        assert!(cooldown.is_eligible("b", event().starts_at));

        let left = queue.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].identity_id, "c");
    }

    #[tokio::test]
    async fn test_drained_record_echo_is_recognised() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let cooldown = CooldownStore::default();
        let t0 = event().starts_at;
        assert!(cooldown.mark_attempted("x", t0));
        queue.enqueue(&payload("x"), t0).await.unwrap();

        let backend = ScriptedBackend::new(vec![Ok(SubmitStatus::Created)]);
        queue
            .drain(&backend, &cooldown, &online(true), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cooldown.entry("x").unwrap().last_checkin_at, t0 + commit_lag());

        let grace = chrono::Duration::seconds(5);
        let outcome = cooldown.merge_remote(&["x"], t0 + commit_lag(), grace);
        assert_eq!(outcome, MergeOutcome::Echo);
    }

    #[tokio::test]
    async fn test_drain_rejection_keeps_newer_local_attempt() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let cooldown = CooldownStore::default();
        let t0 = event().starts_at;
        queue.enqueue(&payload("b"), t0).await.unwrap();

        // The subject was seen again after the stale entry expired.
        let retry_at = t0 + chrono::Duration::minutes(2);
        assert!(cooldown.mark_attempted("b", retry_at));

        let backend = ScriptedBackend::new(vec![Err(BackendError::Rejected("closed".into()))]);
        let report = queue
            .drain(&backend, &cooldown, &online(true), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.rejected.len(), 1);

        let entry = cooldown.entry("b").unwrap();
        assert_eq!(entry.last_checkin_at, retry_at);
        assert_eq!(entry.resolution, Resolution::Attempted);
        assert!(!cooldown.is_eligible("b", retry_at + chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_drain_continues_past_connectivity_failure_while_online() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let cooldown = CooldownStore::default();
        for id in ["a", "b"] {
            queue.enqueue(&payload(id), Utc::now()).await.unwrap();
        }
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::Connectivity("reset".into())),
            Ok(SubmitStatus::Created),
        ]);

        let report = queue
            .drain(&backend, &cooldown, &online(true), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 1));

        let left = queue.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].identity_id, "a");
        assert_eq!(left[0].attempt_count, 1);
        assert_eq!(left[0].last_error.as_deref(), Some("reset"));
    }

    #[tokio::test]
    async fn test_drain_stops_when_offline() {
        let queue = OfflineQueue::in_memory().await.unwrap();
        let cooldown = CooldownStore::default();
        for id in ["a", "b"] {
            queue.enqueue(&payload(id), Utc::now()).await.unwrap();
        }
        let backend = ScriptedBackend::new(vec![Err(BackendError::Connectivity("down".into()))]);

        let report = queue
            .drain(&backend, &cooldown, &online(false), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(report.stopped_offline);
        assert_eq!(*backend.seen.lock().unwrap(), vec!["a"]);
        assert_eq!(queue.length().await.unwrap(), 2);
    }
}
