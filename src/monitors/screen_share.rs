use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::{
    emitter::EventEmitter,
    models::{ProctorEvent, ProctorEventType, Severity},
    sensing::{CaptureRequest, CaptureTrack, DisplayCapture},
};

use super::{lock, screen_lock::ScreenShareContextLock};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ShareState {
    Idle,
    Requesting,
    Sharing,
    /// Still sharing, but the context lock has flagged drift.
    Violated,
    Stopped,
}

struct ShareSession {
    phase: ShareState,
    track: Option<Arc<dyn CaptureTrack>>,
    /// Bumped on every grant so a watcher from an earlier share is inert.
    generation: u64,
    watcher: Option<JoinHandle<()>>,
}

struct ProctorInner {
    emitter: EventEmitter,
    capture: Arc<dyn DisplayCapture>,
    context_lock: ScreenShareContextLock,
    session: Mutex<ShareSession>,
}

impl ProctorInner {
    fn phase(&self) -> ShareState {
        let phase = lock(&self.session).phase;
        if phase == ShareState::Sharing && self.context_lock.violation_count() > 0 {
            ShareState::Violated
        } else {
            phase
        }
    }

    /// Tears the share down. Returns whether a share was live.
    fn teardown(&self, abort_watcher: bool) -> bool {
        self.context_lock.release();
        let (track, watcher, was_sharing) = {
            let mut session = lock(&self.session);
            let was_sharing = session.phase == ShareState::Sharing;
            if session.phase != ShareState::Idle {
                session.phase = ShareState::Stopped;
            }
            (session.track.take(), session.watcher.take(), was_sharing)
        };
        if let Some(track) = track {
            track.stop();
        }
        if abort_watcher {
            if let Some(watcher) = watcher {
                watcher.abort();
            }
        }
        was_sharing
    }

    async fn stop(&self, abort_watcher: bool) {
        if self.teardown(abort_watcher) {
            log_info!("screen share stopped for session {}", self.emitter.context().session_id());
            let event = ProctorEvent::new(
                ProctorEventType::ScreenShareStopped,
                Severity::Low,
                "Screen sharing stopped",
            );
            self.emitter.emit(event).await;
        }
    }

    async fn on_track_ended(&self, generation: u64) {
        {
            let session = lock(&self.session);
            if session.generation != generation || session.phase != ShareState::Sharing {
                return;
            }
        }

        log_warn!("screen share ended from the browser UI");
        let event = ProctorEvent::new(
            ProctorEventType::ScreenShareInterrupted,
            Severity::High,
            "Screen sharing was interrupted",
        )
        .with_field("reason", "User stopped sharing via browser UI");
        self.emitter.emit(event).await;
        self.stop(false).await;
    }
}

/// Owns the screen-capture lifecycle for one attempt and composes the
/// context lock over the granted track.
///
/// `Idle -> Requesting -> Sharing -> (Violated | Stopped)`; a denial returns
/// to `Idle`. Backend termination verdicts on any of its events reach the
/// session terminator through the shared emitter.
pub struct ScreenShareProctor {
    inner: Arc<ProctorInner>,
}

impl ScreenShareProctor {
    pub fn new(
        emitter: EventEmitter,
        capture: Arc<dyn DisplayCapture>,
        context_lock: ScreenShareContextLock,
    ) -> Self {
        Self {
            inner: Arc::new(ProctorInner {
                emitter,
                capture,
                context_lock,
                session: Mutex::new(ShareSession {
                    phase: ShareState::Idle,
                    track: None,
                    generation: 0,
                    watcher: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ShareState {
        self.inner.phase()
    }

    pub fn is_sharing(&self) -> bool {
        matches!(self.state(), ShareState::Sharing | ShareState::Violated)
    }

    pub fn violation_count(&self) -> u32 {
        self.inner.context_lock.violation_count()
    }

    /// Ask the candidate for a whole-screen share. A denial is reported and
    /// leaves the proctor `Idle`; only misuse (a share already in flight) is
    /// an error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut session = lock(&self.inner.session);
            match session.phase {
                ShareState::Requesting | ShareState::Sharing | ShareState::Violated => {
                    bail!("screen share already {:?}", session.phase);
                }
                ShareState::Idle | ShareState::Stopped => session.phase = ShareState::Requesting,
            }
        }

        let track = match self.inner.capture.request_display(&CaptureRequest::monitor()).await {
            Ok(track) => track,
            Err(err) => {
                lock(&self.inner.session).phase = ShareState::Idle;
                log_warn!("screen share denied: {err}");
                let event = ProctorEvent::new(
                    ProctorEventType::ScreenShareDenied,
                    Severity::Medium,
                    err.to_string(),
                )
                .with_field("reason", err.name());
                self.inner.emitter.emit(event).await;
                return Ok(());
            }
        };

        let generation = {
            let mut session = lock(&self.inner.session);
            if session.phase != ShareState::Requesting {
                // Stopped while the permission prompt was open.
                drop(session);
                track.stop();
                return Ok(());
            }
            session.generation += 1;
            session.phase = ShareState::Sharing;
            session.track = Some(track.clone());
            session.generation
        };

        let settings = track.settings();
        log_info!(
            "screen share started for session {} ({:?})",
            self.inner.emitter.context().session_id(),
            settings.display_surface
        );
        let event = ProctorEvent::new(
            ProctorEventType::ScreenShareStarted,
            Severity::Low,
            "Screen sharing started",
        )
        .with_field("metadata", &settings);
        self.inner.emitter.emit(event).await;

        self.inner.context_lock.engage(track.clone()).await?;

        let inner = self.inner.clone();
        let watched = track.clone();
        let watcher = tokio::spawn(async move {
            watched.wait_ended().await;
            inner.on_track_ended(generation).await;
        });
        let mut session = lock(&self.inner.session);
        if session.generation == generation && session.phase == ShareState::Sharing {
            session.watcher = Some(watcher);
        } else {
            watcher.abort();
        }
        Ok(())
    }

    /// Stops the tracks and the context lock, then logs `screen_share_stopped`
    /// if a share was live.
    pub async fn stop(&self) {
        self.inner.stop(true).await;
    }

    /// Synchronous teardown with no event: used on session end and
    /// termination. Idempotent.
    pub fn deactivate(&self) {
        self.inner.teardown(true);
    }
}

impl Drop for ScreenShareProctor {
    fn drop(&mut self) {
        self.inner.teardown(true);
    }
}
