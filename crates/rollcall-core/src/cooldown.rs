//! Cooldown and duplicate-suppression state shared by the local detection
//! path and the realtime merge path.
//!
//! Every operation runs under a single lock, so a local optimistic write and
//! a near-simultaneous remote merge for the same identity cannot lose each
//! other's update.

use crate::tracker::EligibilityGate;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_COOLDOWN_SECS: i64 = 60;

/// How the timestamp in a cooldown entry came to be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Written optimistically before the backend answered.
    Attempted,
    /// Backed by a committed record (local success or remote feed).
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownEntry {
    pub last_checkin_at: DateTime<Utc>,
    pub resolution: Resolution,
}

/// Result of merging one realtime feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A check-in this terminal did not already know about.
    Applied,
    /// This terminal's own submission (or a redelivery) seen again.
    Echo,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CooldownEntry>,
    /// participant id <-> account id, stored in both directions.
    aliases: HashMap<String, String>,
    /// identity -> instant until which "already checked in" stays silent.
    suppression: HashMap<String, DateTime<Utc>>,
    /// Identities whose last submission was refused, held until they leave view.
    rejected: HashSet<String>,
}

impl Inner {
    fn keys(&self, id: &str) -> Vec<String> {
        let mut keys = vec![id.to_string()];
        if let Some(alias) = self.aliases.get(id) {
            keys.push(alias.clone());
        }
        keys
    }

    fn is_rejected(&self, keys: &[String]) -> bool {
        keys.iter().any(|key| self.rejected.contains(key))
    }

    fn eligible(&self, keys: &[String], now: DateTime<Utc>, window: Duration) -> bool {
        keys.iter().all(|key| match self.entries.get(key) {
            None => true,
            Some(entry) => now - entry.last_checkin_at >= window,
        })
    }

    fn write_max(&mut self, key: &str, at: DateTime<Utc>, resolution: Resolution) {
        let entry = self.entries.entry(key.to_string()).or_insert(CooldownEntry {
            last_checkin_at: at,
            resolution,
        });
        if at > entry.last_checkin_at {
            entry.last_checkin_at = at;
        }
        if resolution == Resolution::Confirmed {
            entry.resolution = Resolution::Confirmed;
        }
    }
}

/// Identity -> last check-in time, plus the duplicate-notice suppression map.
pub struct CooldownStore {
    window: Duration,
    inner: Mutex<Inner>,
}

impl Default for CooldownStore {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_COOLDOWN_SECS))
    }
}

impl CooldownStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Link a participant id and an account id so that either key covers both.
    pub fn register_alias(&self, participant_id: &str, account_id: &str) {
        let mut inner = self.lock();
        inner
            .aliases
            .insert(participant_id.to_string(), account_id.to_string());
        inner
            .aliases
            .insert(account_id.to_string(), participant_id.to_string());
    }

    pub fn is_eligible(&self, identity_id: &str, now: DateTime<Utc>) -> bool {
        let inner = self.lock();
        let keys = inner.keys(identity_id);
        inner.eligible(&keys, now, self.window)
    }

    /// Atomically check eligibility and record an optimistic attempt.
    ///
    /// Returns `false`, writing nothing, when the identity is still cooling
    /// down or its last submission was rejected during the current presence.
    pub fn mark_attempted(&self, identity_id: &str, at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let keys = inner.keys(identity_id);
        if inner.is_rejected(&keys) || !inner.eligible(&keys, at, self.window) {
            return false;
        }
        for key in &keys {
            inner.entries.insert(
                key.clone(),
                CooldownEntry {
                    last_checkin_at: at,
                    resolution: Resolution::Attempted,
                },
            );
        }
        true
    }

    /// Record a committed check-in. Never moves an entry backwards in time.
    pub fn mark_confirmed(&self, identity_id: &str, at: DateTime<Utc>) {
        let mut inner = self.lock();
        for key in inner.keys(identity_id) {
            inner.write_max(&key, at, Resolution::Confirmed);
        }
    }

    /// Undo the optimistic attempt written at `at` after a confirmed failure.
    ///
    /// Confirmed entries are left alone, since another terminal may have
    /// checked the identity in meanwhile, and so is any newer attempt.
    pub fn clear_attempt_at(&self, identity_id: &str, at: DateTime<Utc>) {
        let mut inner = self.lock();
        for key in inner.keys(identity_id) {
            let stale = inner.entries.get(&key).is_some_and(|entry| {
                entry.resolution == Resolution::Attempted && entry.last_checkin_at == at
            });
            if stale {
                inner.entries.remove(&key);
            }
        }
    }

    /// Block further attempts for `identity_id` until [`clear_rejection`]
    /// runs, normally when the subject or card leaves view.
    ///
    /// [`clear_rejection`]: CooldownStore::clear_rejection
    pub fn mark_rejected(&self, identity_id: &str) {
        let mut inner = self.lock();
        for key in inner.keys(identity_id) {
            inner.rejected.insert(key);
        }
    }

    pub fn is_rejected(&self, identity_id: &str) -> bool {
        let inner = self.lock();
        let keys = inner.keys(identity_id);
        inner.is_rejected(&keys)
    }

    pub fn clear_rejection(&self, identity_id: &str) {
        let mut inner = self.lock();
        for key in inner.keys(identity_id) {
            inner.rejected.remove(&key);
        }
    }

    /// Merge a remote check-in announced on the realtime feed.
    ///
    /// An existing entry within `grace` of `at` on any key marks the event as
    /// an echo. Either way every key ends at `max(existing, at)`, which makes
    /// the merge idempotent and independent of delivery order.
    pub fn merge_remote(
        &self,
        keys: &[&str],
        at: DateTime<Utc>,
        grace: Duration,
    ) -> MergeOutcome {
        let mut inner = self.lock();

        let mut all_keys: Vec<String> = Vec::new();
        for key in keys {
            for k in inner.keys(key) {
                if !all_keys.contains(&k) {
                    all_keys.push(k);
                }
            }
        }

        let echo = all_keys.iter().any(|key| {
            inner
                .entries
                .get(key)
                .is_some_and(|entry| (entry.last_checkin_at - at).abs() <= grace)
        });

        for key in &all_keys {
            inner.write_max(key, at, Resolution::Confirmed);
        }

        if echo {
            MergeOutcome::Echo
        } else {
            MergeOutcome::Applied
        }
    }

    pub fn entry(&self, identity_id: &str) -> Option<CooldownEntry> {
        self.lock().entries.get(identity_id).copied()
    }

    /// Sorted copy of every entry, for inspection and convergence checks.
    pub fn snapshot(&self) -> Vec<(String, CooldownEntry)> {
        let mut entries: Vec<_> = self
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Decide whether an "already checked in" notice should be shown now.
    ///
    /// The first call for an identity returns `true` and opens a suppression
    /// window that lasts until the identity becomes eligible again; calls
    /// inside the window return `false`. A rejected identity is never
    /// reported as checked in.
    pub fn should_report_duplicate(&self, identity_id: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let keys = inner.keys(identity_id);
        if inner.is_rejected(&keys) {
            return false;
        }
        if let Some(expiry) = inner.suppression.get(identity_id) {
            if now < *expiry {
                return false;
            }
        }
        let latest = keys
            .iter()
            .filter_map(|key| inner.entries.get(key))
            .map(|entry| entry.last_checkin_at)
            .max();
        let expiry = match latest {
            Some(last) => last + self.window,
            None => now + self.window,
        };
        inner.suppression.insert(identity_id.to_string(), expiry);
        true
    }

    pub fn clear_suppression(&self, identity_id: &str) {
        self.lock().suppression.remove(identity_id);
    }

    /// Forget every duplicate notice and rejection hold (mode switch).
    pub fn clear_all_suppression(&self) {
        let mut inner = self.lock();
        inner.suppression.clear();
        inner.rejected.clear();
    }
}

impl EligibilityGate for CooldownStore {
    fn try_acquire(&self, identity_id: &str, now: DateTime<Utc>) -> bool {
        self.mark_attempted(identity_id, now)
    }

    fn report_duplicate(&self, identity_id: &str, now: DateTime<Utc>) -> bool {
        self.should_report_duplicate(identity_id, now)
    }

    fn end_session(&self, identity_id: &str) {
        self.clear_suppression(identity_id);
        self.clear_rejection(identity_id);
    }
}
