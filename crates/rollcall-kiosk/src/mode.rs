//! Exclusive ownership of the camera between face and QR capture.

use crate::capture::{CaptureError, CaptureSource, Frame};
use crate::error::CheckinError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Face,
    Qr,
}

impl CaptureMode {
    fn as_u8(self) -> u8 {
        match self {
            CaptureMode::Face => 0,
            CaptureMode::Qr => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 1 {
            CaptureMode::Qr
        } else {
            CaptureMode::Face
        }
    }
}

struct Active {
    mode: CaptureMode,
    running: bool,
}

/// Owns whichever capture source is active and serializes switches.
pub struct ModeCoordinator {
    face: Arc<dyn CaptureSource>,
    qr: Arc<dyn CaptureSource>,
    active: Mutex<Active>,
    /// Lock-free mirror of `active.mode` for readers that must not wait on a frame.
    mode: AtomicU8,
    /// Bumped whenever the active source is released; pending frame reads give up.
    generation: watch::Sender<u64>,
    release_grace: Duration,
    retry_delay: Duration,
}

impl ModeCoordinator {
    pub fn new(
        face: Arc<dyn CaptureSource>,
        qr: Arc<dyn CaptureSource>,
        initial: CaptureMode,
        release_grace: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            face,
            qr,
            active: Mutex::new(Active {
                mode: initial,
                running: false,
            }),
            mode: AtomicU8::new(initial.as_u8()),
            generation: watch::channel(0).0,
            release_grace,
            retry_delay,
        }
    }

    pub fn current(&self) -> CaptureMode {
        CaptureMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn source(&self, mode: CaptureMode) -> &Arc<dyn CaptureSource> {
        match mode {
            CaptureMode::Face => &self.face,
            CaptureMode::Qr => &self.qr,
        }
    }

    /// Start the current mode's source, with one retry.
    pub async fn start(&self) -> Result<(), CheckinError> {
        let mut active = self.active.lock().await;
        if active.running {
            return Ok(());
        }
        self.start_with_retry(active.mode).await?;
        active.running = true;
        Ok(())
    }

    /// Switch to `target`, releasing the current source first.
    ///
    /// `reset` runs after the old source is released and before the new one
    /// starts; the session uses it to clear tracker and suppression state.
    /// Switching to the current mode is a no-op.
    pub async fn switch_to<F>(
        &self,
        target: CaptureMode,
        reset: F,
    ) -> Result<(), CheckinError>
    where
        F: FnOnce() + Send,
    {
        let mut active = self.active.lock().await;
        if active.mode == target && active.running {
            return Ok(());
        }

        let from = active.mode;
        if active.running {
            self.interrupt_readers();
            self.source(from).stop().await;
            active.running = false;
            tracing::debug!(source = self.source(from).name(), "capture released");
        }
        tokio::time::sleep(self.release_grace).await;

        reset();
        active.mode = target;
        self.mode.store(target.as_u8(), Ordering::Release);

        self.start_with_retry(target).await?;
        active.running = true;
        tracing::info!(?from, to = ?target, "capture mode switched");
        Ok(())
    }

    async fn start_with_retry(&self, mode: CaptureMode) -> Result<(), CheckinError> {
        let source = self.source(mode);
        match source.start().await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    source = source.name(),
                    error = %first,
                    retry_in_ms = self.retry_delay.as_millis() as u64,
                    "capture start failed; retrying once"
                );
                tokio::time::sleep(self.retry_delay).await;
                source.start().await.map_err(|e| {
                    tracing::error!(
                        source = source.name(),
                        error = %e,
                        "capture start failed after retry"
                    );
                    CheckinError::ResourceBusy(e)
                })
            }
        }
    }

    fn interrupt_readers(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Read one frame from the active source.
    ///
    /// The switch lock is released before waiting on the source, and the
    /// read returns [`CaptureError::Interrupted`] if the source is released
    /// while it waits.
    pub async fn next_frame(&self) -> Result<(CaptureMode, Frame), CaptureError> {
        let (mode, source, mut released) = {
            let active = self.active.lock().await;
            if !active.running {
                return Err(CaptureError::NotStarted);
            }
            (
                active.mode,
                Arc::clone(self.source(active.mode)),
                self.generation.subscribe(),
            )
        };

        tokio::select! {
            frame = source.next_frame() => Ok((mode, frame?)),
            _ = released.changed() => Err(CaptureError::Interrupted),
        }
    }

    /// Release the active source.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if active.running {
            self.interrupt_readers();
            self.source(active.mode).stop().await;
            active.running = false;
        }
    }
}
