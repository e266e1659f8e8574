use crate::error::CheckinError;
use crate::mode::CaptureMode;
use chrono::{DateTime, Utc};
use rollcall_core::{EventContext, TrackerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kiosk engine configuration.
///
/// Defaults are overridden by an optional TOML file, which is in turn
/// overridden by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    /// Path to the SQLite offline queue.
    pub queue_db_path: PathBuf,
    /// Minimum calibrated confidence (percent) for a descriptor match.
    pub match_threshold: f32,
    /// Minimum face-to-frame size ratio before a face is considered close enough.
    pub min_face_ratio: f32,
    /// How long one identity must be tracked before a check-in is attempted.
    pub stability_window_ms: u64,
    /// Minimum time between two check-ins for the same identity.
    pub cooldown_secs: u64,
    /// Realtime events this close to a local entry are treated as echoes.
    /// Tuned empirically; raise it on slow networks.
    pub echo_grace_ms: u64,
    /// Detection polling interval.
    pub poll_interval_ms: u64,
    /// Bound on one backend submission before its outcome is treated as ambiguous.
    pub submit_timeout_secs: u64,
    /// Periodic offline queue drain interval while online.
    pub drain_interval_secs: u64,
    /// Delay between releasing one capture resource and acquiring the next.
    pub mode_switch_grace_ms: u64,
    /// Delay before the single automatic capture start retry.
    pub capture_retry_delay_ms: u64,
    /// Delay before re-subscribing after the realtime feed drops.
    pub feed_reconnect_delay_ms: u64,
    /// Minutes after event start during which check-ins count as on time.
    pub late_after_mins: u64,
    /// Mode the session starts in.
    pub initial_mode: CaptureMode,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            queue_db_path: default_data_dir().join("queue.db"),
            match_threshold: 50.0,
            min_face_ratio: 0.2,
            stability_window_ms: 600,
            cooldown_secs: 60,
            echo_grace_ms: 5_000,
            poll_interval_ms: 150,
            submit_timeout_secs: 8,
            drain_interval_secs: 30,
            mode_switch_grace_ms: 300,
            capture_retry_delay_ms: 1_000,
            feed_reconnect_delay_ms: 2_000,
            late_after_mins: 15,
            initial_mode: CaptureMode::Face,
        }
    }
}

impl KioskConfig {
    /// Defaults plus `ROLLCALL_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_toml_file(path: &Path) -> Result<Self, CheckinError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CheckinError::Config(format!("{}: {e}", path.display())))?;
        let mut config: Self = toml::from_str(&text)
            .map_err(|e| CheckinError::Config(format!("{}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("ROLLCALL_QUEUE_DB") {
            self.queue_db_path = PathBuf::from(path);
        }
        self.match_threshold = env_parse("ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.min_face_ratio = env_parse("ROLLCALL_MIN_FACE_RATIO", self.min_face_ratio);
        self.stability_window_ms =
            env_parse("ROLLCALL_STABILITY_WINDOW_MS", self.stability_window_ms);
        self.cooldown_secs = env_parse("ROLLCALL_COOLDOWN_SECS", self.cooldown_secs);
        self.echo_grace_ms = env_parse("ROLLCALL_ECHO_GRACE_MS", self.echo_grace_ms);
        self.poll_interval_ms = env_parse("ROLLCALL_POLL_INTERVAL_MS", self.poll_interval_ms);
        self.submit_timeout_secs =
            env_parse("ROLLCALL_SUBMIT_TIMEOUT_SECS", self.submit_timeout_secs);
        self.drain_interval_secs =
            env_parse("ROLLCALL_DRAIN_INTERVAL_SECS", self.drain_interval_secs);
        self.mode_switch_grace_ms =
            env_parse("ROLLCALL_MODE_SWITCH_GRACE_MS", self.mode_switch_grace_ms);
        self.capture_retry_delay_ms =
            env_parse("ROLLCALL_CAPTURE_RETRY_DELAY_MS", self.capture_retry_delay_ms);
        self.feed_reconnect_delay_ms =
            env_parse("ROLLCALL_FEED_RECONNECT_DELAY_MS", self.feed_reconnect_delay_ms);
        self.late_after_mins = env_parse("ROLLCALL_LATE_AFTER_MINS", self.late_after_mins);
        if let Ok(mode) = std::env::var("ROLLCALL_INITIAL_MODE") {
            match mode.as_str() {
                "face" => self.initial_mode = CaptureMode::Face,
                "qr" => self.initial_mode = CaptureMode::Qr,
                other => {
                    tracing::warn!(value = other, "ignoring unknown ROLLCALL_INITIAL_MODE")
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), CheckinError> {
        if !(0.0..=100.0).contains(&self.match_threshold) {
            return Err(CheckinError::Config(format!(
                "match_threshold must be within 0..=100, got {}",
                self.match_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_face_ratio) {
            return Err(CheckinError::Config(format!(
                "min_face_ratio must be within 0..=1, got {}",
                self.min_face_ratio
            )));
        }
        if self.poll_interval_ms == 0 || self.drain_interval_secs == 0 {
            return Err(CheckinError::Config(
                "poll and drain intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            match_threshold: self.match_threshold,
            min_face_ratio: self.min_face_ratio,
            stability_window: chrono::Duration::milliseconds(self.stability_window_ms as i64),
        }
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn echo_grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.echo_grace_ms as i64)
    }

    pub fn late_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.late_after_mins as i64)
    }

    /// Event context for an event starting at `starts_at`, with the
    /// configured lateness threshold.
    pub fn event_context(
        &self,
        event_id: impl Into<String>,
        starts_at: DateTime<Utc>,
    ) -> EventContext {
        EventContext {
            event_id: event_id.into(),
            starts_at,
            late_after: self.late_after(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn mode_switch_grace(&self) -> Duration {
        Duration::from_millis(self.mode_switch_grace_ms)
    }

    pub fn capture_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capture_retry_delay_ms)
    }

    pub fn feed_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.feed_reconnect_delay_ms)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
