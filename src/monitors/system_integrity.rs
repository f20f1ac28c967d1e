use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::time::Duration;

use crate::{
    config::IntegrityConfig,
    models::ProctorEventType,
    sensing::{PeriodicTask, WindowMetrics, WindowProbe},
};

use super::{lock, ViolationSink};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const DEVTOOLS_MESSAGE: &str = "Developer Tools are disabled.";
const SOURCE_VIEW_MESSAGE: &str = "View Source is disabled.";
const SCREENSHOT_MESSAGE: &str = "Screenshots are prohibited.";
const VIEWPORT_MESSAGE: &str =
    "Screen space reduced significantly. Close any side panels (DevTools) or Maximize the window.";

/// A keyboard event as the page saw it. `meta` is Cmd on macOS and the
/// Windows key elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    pub key: String,
    pub code: String,
    #[serde(rename = "ctrlKey")]
    pub ctrl: bool,
    #[serde(rename = "metaKey")]
    pub meta: bool,
    #[serde(rename = "shiftKey")]
    pub shift: bool,
}

impl KeyEvent {
    pub fn key(key: &str) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn with_meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }

    fn is_print_screen(&self) -> bool {
        self.key == "PrintScreen" || self.code == "PrintScreen"
    }
}

/// What the host should do with the DOM event after the monitor saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Allow,
    /// `preventDefault` + `stopPropagation`.
    Prevent,
}

/// Maps a keydown to the violation it represents, if any.
pub fn classify_shortcut(event: &KeyEvent) -> Option<(ProctorEventType, &'static str)> {
    let upper = event.key.to_uppercase();
    let command = event.ctrl || event.meta;

    if event.key == "F12" {
        return Some((ProctorEventType::DevtoolsAttempt, DEVTOOLS_MESSAGE));
    }
    if command && event.shift && matches!(upper.as_str(), "I" | "C" | "J") {
        return Some((ProctorEventType::DevtoolsAttempt, DEVTOOLS_MESSAGE));
    }
    if command && upper == "U" {
        return Some((ProctorEventType::SourceViewAttempt, SOURCE_VIEW_MESSAGE));
    }

    let snipping_tool = event.meta && event.shift && upper == "S";
    let mac_capture = event.meta && event.shift && matches!(event.key.as_str(), "3" | "4");
    if event.is_print_screen() || snipping_tool || mac_capture {
        return Some((ProctorEventType::ScreenshotAttempt, SCREENSHOT_MESSAGE));
    }
    None
}

/// Docked devtools heuristic: large chrome on either axis while the page is
/// noticeably narrower than the available screen.
pub fn is_viewport_compromised(metrics: &WindowMetrics, config: &IntegrityConfig) -> bool {
    let large_chrome =
        metrics.width_chrome() > config.chrome_delta_px || metrics.height_chrome() > config.chrome_delta_px;
    let narrowed = (metrics.inner_width as f64) < metrics.avail_width as f64 * config.min_width_ratio;
    large_chrome && narrowed
}

/// Best-effort clipboard overwrite used to spoil screenshots.
pub trait ClipboardWriter: Send + Sync {
    fn write_text(&self, text: &str) -> Result<()>;
}

struct IntegrityInner {
    config: IntegrityConfig,
    window: Arc<dyn WindowProbe>,
    clipboard: Arc<dyn ClipboardWriter>,
    violations: Arc<dyn ViolationSink>,
    active: AtomicBool,
    compromised: AtomicBool,
}

impl IntegrityInner {
    fn report(&self, event_type: ProctorEventType, message: &str) {
        if event_type == ProctorEventType::ScreenshotAttempt {
            if let Err(err) = self.clipboard.write_text(&self.config.clipboard_placeholder) {
                log_warn!("clipboard scrub failed: {err:?}");
            }
        }
        log_warn!("system integrity: {}", event_type);
        self.violations.on_violation(event_type, message);
    }

    fn check_viewport(&self) -> bool {
        let compromised = is_viewport_compromised(&self.window.metrics(), &self.config);
        self.compromised.store(compromised, Ordering::SeqCst);
        if compromised && self.active.load(Ordering::SeqCst) {
            self.violations
                .on_violation(ProctorEventType::ViewportCompromised, VIEWPORT_MESSAGE);
        }
        compromised
    }
}

/// Shortcut blocking, silent context-menu suppression and the docked-devtools
/// viewport poll. Signals go to the host's violation sink, not the backend.
pub struct SystemIntegrityMonitor {
    inner: Arc<IntegrityInner>,
    poller: Mutex<PeriodicTask>,
}

impl SystemIntegrityMonitor {
    pub fn new(
        config: IntegrityConfig,
        window: Arc<dyn WindowProbe>,
        clipboard: Arc<dyn ClipboardWriter>,
        violations: Arc<dyn ViolationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(IntegrityInner {
                config,
                window,
                clipboard,
                violations,
                active: AtomicBool::new(false),
                compromised: AtomicBool::new(false),
            }),
            poller: Mutex::new(PeriodicTask::new("viewport-integrity-poll")),
        }
    }

    pub fn activate(&self) -> Result<()> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let period = Duration::from_millis(self.inner.config.viewport_poll_ms);
        lock(&self.poller).start(period, move || {
            let inner = inner.clone();
            async move {
                inner.check_viewport();
            }
        })?;
        log_info!("system integrity monitor active");
        Ok(())
    }

    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        lock(&self.poller).stop();
    }

    /// Latest viewport verdict from the poller.
    pub fn is_compromised(&self) -> bool {
        self.inner.compromised.load(Ordering::SeqCst)
    }

    /// Runs the viewport check immediately. Reports only while active.
    pub fn check_viewport(&self) -> bool {
        self.inner.check_viewport()
    }

    pub fn on_key_down(&self, event: &KeyEvent) -> EventDisposition {
        if !self.inner.active.load(Ordering::SeqCst) {
            return EventDisposition::Allow;
        }
        match classify_shortcut(event) {
            Some((event_type, message)) => {
                self.inner.report(event_type, message);
                EventDisposition::Prevent
            }
            None => EventDisposition::Allow,
        }
    }

    /// PrintScreen is often swallowed by the OS on keydown; the keyup is the
    /// fallback.
    pub fn on_key_up(&self, event: &KeyEvent) -> EventDisposition {
        if !self.inner.active.load(Ordering::SeqCst) || !event.is_print_screen() {
            return EventDisposition::Allow;
        }
        self.inner
            .report(ProctorEventType::ScreenshotAttempt, SCREENSHOT_MESSAGE);
        EventDisposition::Prevent
    }

    /// Right-click is blocked but never reported.
    pub fn on_context_menu(&self) -> EventDisposition {
        if self.inner.active.load(Ordering::SeqCst) {
            EventDisposition::Prevent
        } else {
            EventDisposition::Allow
        }
    }
}
