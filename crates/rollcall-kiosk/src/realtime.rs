//! Merges check-ins created by other terminals into the local cooldown store.

use crate::collaborators::CheckinFeed;
use crate::events::KioskEvent;
use rollcall_core::{CooldownStore, DescriptorMatcher, FeedEvent, MergeOutcome};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Shown when a remote record names someone missing from the local roster.
pub const UNKNOWN_PARTICIPANT: &str = "Participant";

pub struct MergeListener {
    event_id: String,
    feed: Arc<dyn CheckinFeed>,
    cooldown: Arc<CooldownStore>,
    roster: Arc<RwLock<DescriptorMatcher>>,
    grace: chrono::Duration,
    reconnect_delay: Duration,
    events: broadcast::Sender<KioskEvent>,
}

impl MergeListener {
    pub fn new(
        event_id: impl Into<String>,
        feed: Arc<dyn CheckinFeed>,
        cooldown: Arc<CooldownStore>,
        roster: Arc<RwLock<DescriptorMatcher>>,
        grace: chrono::Duration,
        reconnect_delay: Duration,
        events: broadcast::Sender<KioskEvent>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            feed,
            cooldown,
            roster,
            grace,
            reconnect_delay,
            events,
        }
    }

    /// Merge one feed event. Returns `None` when it belongs to another event
    /// or carries no identity key.
    pub fn apply(&self, event: &FeedEvent) -> Option<MergeOutcome> {
        if event.event_id != self.event_id {
            tracing::trace!(event = %event.event_id, "ignoring feed event for another event");
            return None;
        }

        let keys: Vec<&str> = [event.participant_id.as_deref(), event.account_id.as_deref()]
            .into_iter()
            .flatten()
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            tracing::warn!("feed event without identity key");
            return None;
        }

        let outcome = self.cooldown.merge_remote(&keys, event.submitted_at, self.grace);

        if outcome == MergeOutcome::Applied {
            let display_name = self.display_name(&keys);
            tracing::info!(identity = keys[0], name = %display_name, "remote check-in merged");
            // No receivers just means no screen is attached.
            let _ = self.events.send(KioskEvent::RemoteCheckin {
                identity_id: keys[0].to_string(),
                display_name,
            });
        } else {
            tracing::debug!(identity = keys[0], "feed echo merged silently");
        }
        Some(outcome)
    }

    fn display_name(&self, keys: &[&str]) -> String {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        keys.iter()
            .find_map(|key| roster.display_name(key))
            .unwrap_or(UNKNOWN_PARTICIPANT)
            .to_string()
    }

    /// Subscribe and merge until the task is cancelled, re-subscribing after
    /// a fixed delay whenever the feed drops or the handshake fails.
    pub async fn run(&self) {
        loop {
            match self.feed.subscribe(&self.event_id).await {
                Ok(mut rx) => {
                    tracing::info!(event = %self.event_id, "realtime feed subscribed");
                    while let Some(event) = rx.recv().await {
                        self.apply(&event);
                    }
                    tracing::warn!(event = %self.event_id, "realtime feed closed");
                }
                Err(e) => {
                    tracing::warn!(event = %self.event_id, error = %e, "realtime subscribe failed");
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}
