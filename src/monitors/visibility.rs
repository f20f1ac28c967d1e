use std::sync::{Arc, Mutex};

use crate::{
    emitter::EventEmitter,
    models::{ProctorEvent, ProctorEventType, Severity},
};

use super::{lock, WarningDisplay};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Pre-test gate: nothing counts as a violation until the candidate has
/// explicitly opted in (the "enter fullscreen to begin" button).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullscreenGate {
    AwaitingOptIn,
    Armed,
}

struct VisibilityState {
    active: bool,
    gate: FullscreenGate,
    warning_count: u32,
    blurred_at_ms: Option<u64>,
    hidden_on_blur: bool,
}

/// Fullscreen exits, tab/app switches and focus loss. Purely event driven and
/// not rate limited: every hide is its own event.
pub struct VisibilityMonitor {
    emitter: EventEmitter,
    warnings: Arc<dyn WarningDisplay>,
    min_focus_loss_ms: u64,
    state: Mutex<VisibilityState>,
}

impl VisibilityMonitor {
    pub fn new(
        emitter: EventEmitter,
        warnings: Arc<dyn WarningDisplay>,
        min_focus_loss_ms: u64,
    ) -> Self {
        Self {
            emitter,
            warnings,
            min_focus_loss_ms,
            state: Mutex::new(VisibilityState {
                active: false,
                gate: FullscreenGate::AwaitingOptIn,
                warning_count: 0,
                blurred_at_ms: None,
                hidden_on_blur: false,
            }),
        }
    }

    pub fn activate(&self) {
        lock(&self.state).active = true;
    }

    pub fn deactivate(&self) {
        let mut state = lock(&self.state);
        state.active = false;
        state.blurred_at_ms = None;
    }

    /// The candidate pressed the explicit start button and is in fullscreen.
    pub fn opt_in(&self) {
        let mut state = lock(&self.state);
        if state.gate == FullscreenGate::AwaitingOptIn {
            log_info!("fullscreen gate armed for session {}", self.emitter.context().session_id());
        }
        state.gate = FullscreenGate::Armed;
    }

    pub fn gate(&self) -> FullscreenGate {
        lock(&self.state).gate
    }

    pub fn warning_count(&self) -> u32 {
        lock(&self.state).warning_count
    }

    fn tracking(&self) -> bool {
        let state = lock(&self.state);
        state.active && state.gate == FullscreenGate::Armed && self.emitter.context().is_active()
    }

    pub async fn on_fullscreen_change(&self, is_fullscreen: bool) {
        if is_fullscreen || !self.tracking() {
            return;
        }

        let warning_count = {
            let mut state = lock(&self.state);
            state.warning_count += 1;
            state.warning_count
        };
        let message = "You exited fullscreen mode.";
        log_warn!("fullscreen exit #{} in session {}", warning_count, self.emitter.context().session_id());
        self.warnings.show_warning(message);

        let event = ProctorEvent::new(ProctorEventType::FullscreenExit, Severity::Medium, message)
            .with_field("warning_count", warning_count);
        self.emitter.emit(event).await;
    }

    pub async fn on_visibility_change(&self, hidden: bool) {
        if !hidden || !self.tracking() {
            return;
        }

        let message = "You switched tabs or minimized the browser.";
        self.warnings.show_warning(message);
        let now = self.emitter.clock().now_ms();
        {
            let mut state = lock(&self.state);
            if state.blurred_at_ms.is_none() {
                state.blurred_at_ms = Some(now);
            }
            state.hidden_on_blur = true;
        }

        let event = ProctorEvent::new(ProctorEventType::TabSwitch, Severity::Medium, message);
        self.emitter.emit(event).await;
    }

    pub fn on_blur(&self, document_hidden: bool) {
        if !self.tracking() {
            return;
        }
        let now = self.emitter.clock().now_ms();
        let mut state = lock(&self.state);
        if state.blurred_at_ms.is_none() {
            state.blurred_at_ms = Some(now);
            state.hidden_on_blur = document_hidden;
        }
    }

    /// `screen_sharing` is the host's view of the screen-share state at the
    /// moment focus returns.
    pub async fn on_focus(&self, screen_sharing: bool) {
        let now = self.emitter.clock().now_ms();
        let (duration_ms, was_hidden) = {
            let mut state = lock(&self.state);
            let Some(blurred_at) = state.blurred_at_ms.take() else {
                return;
            };
            (now.saturating_sub(blurred_at), state.hidden_on_blur)
        };

        if duration_ms <= self.min_focus_loss_ms || !self.tracking() {
            return;
        }

        let seconds = duration_ms as f64 / 1000.0;
        let event_type = if screen_sharing {
            ProctorEventType::FocusLostWhileScreenSharing
        } else {
            ProctorEventType::FocusLost
        };
        let event = ProctorEvent::new(
            event_type,
            Severity::Medium,
            format!("Focus lost for {seconds:.1}s."),
        )
        .with_field("duration_seconds", seconds)
        .with_field("was_hidden", was_hidden);
        self.emitter.emit(event).await;
    }
}
