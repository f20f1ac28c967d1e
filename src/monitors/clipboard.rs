use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::{
    config::ClipboardConfig,
    emitter::EventEmitter,
    models::{ProctorEvent, ProctorEventType, Severity},
};

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Clone, PartialEq)]
pub struct PasteVerdict {
    pub severity: Severity,
    pub reason: String,
    /// False for pastes below the noise gate.
    pub report: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PasteStats {
    pub paste_count: u32,
    pub total_pasted_chars: u64,
    pub rapid_run: u32,
}

/// Session-lifetime paste counters and the size/frequency classifier.
///
/// The rapid-sequence rule counts the current run of pastes that each landed
/// within `rapid_window_ms` of the previous one, rather than the cumulative
/// session count, so a long session does not make every quick pair "rapid".
#[derive(Debug, Clone)]
pub struct PasteTracker {
    config: ClipboardConfig,
    stats: PasteStats,
    last_paste_ms: Option<u64>,
}

impl PasteTracker {
    pub fn new(config: ClipboardConfig) -> Self {
        Self {
            config,
            stats: PasteStats::default(),
            last_paste_ms: None,
        }
    }

    pub fn stats(&self) -> PasteStats {
        self.stats
    }

    pub fn record(&mut self, content_length: usize, now_ms: u64) -> PasteVerdict {
        let config = &self.config;
        self.stats.paste_count += 1;
        self.stats.total_pasted_chars += content_length as u64;
        let paste_count = self.stats.paste_count;

        let (mut severity, mut reason) = if content_length > config.critical_length {
            (
                Severity::Critical,
                Some(format!(
                    "Large paste detected: {content_length} characters (likely copied from external source)"
                )),
            )
        } else if content_length > config.paste_threshold {
            (
                Severity::High,
                Some(format!("Suspicious paste detected: {content_length} characters")),
            )
        } else if paste_count > config.frequent_paste_count {
            (
                Severity::Medium,
                Some(format!(
                    "Frequent paste activity: {} pastes totaling {} chars",
                    paste_count, self.stats.total_pasted_chars
                )),
            )
        } else {
            (Severity::Low, None)
        };

        let quick_follow_up = self
            .last_paste_ms
            .map(|last| now_ms.saturating_sub(last) < config.rapid_window_ms)
            .unwrap_or(false);
        self.stats.rapid_run = if quick_follow_up {
            self.stats.rapid_run + 1
        } else {
            1
        };
        if quick_follow_up && self.stats.rapid_run > config.rapid_run_length {
            if severity == Severity::Low {
                severity = Severity::Medium;
            }
            reason = Some(format!(
                "Rapid paste sequence detected: {} pastes",
                self.stats.rapid_run
            ));
        }
        self.last_paste_ms = Some(now_ms);

        let report = content_length > config.min_report_length
            || paste_count > config.min_report_count;

        PasteVerdict {
            severity,
            reason: reason.unwrap_or_else(|| format!("Paste event: {content_length} chars")),
            report,
        }
    }
}

type PasteViolationHook = Arc<dyn Fn(usize) + Send + Sync>;

struct ClipboardState {
    active: bool,
    tracker: PasteTracker,
}

pub struct ClipboardMonitor {
    emitter: EventEmitter,
    state: Mutex<ClipboardState>,
    on_violation: Option<PasteViolationHook>,
}

impl ClipboardMonitor {
    pub fn new(emitter: EventEmitter, config: ClipboardConfig) -> Self {
        Self {
            emitter,
            state: Mutex::new(ClipboardState {
                active: false,
                tracker: PasteTracker::new(config),
            }),
            on_violation: None,
        }
    }

    /// Host hook for `high`/`critical` pastes, called after the event is logged.
    pub fn with_violation_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_violation = Some(Arc::new(hook));
        self
    }

    pub fn activate(&self) {
        lock(&self.state).active = true;
    }

    pub fn deactivate(&self) {
        lock(&self.state).active = false;
    }

    pub fn stats(&self) -> PasteStats {
        lock(&self.state).tracker.stats()
    }

    /// `content_length` is the length of the pasted text as read from the
    /// clipboard event.
    pub async fn on_paste(&self, content_length: usize) {
        if !self.emitter.context().is_active() {
            return;
        }
        let now = self.emitter.clock().now_ms();
        let (verdict, stats) = {
            let mut state = lock(&self.state);
            if !state.active {
                return;
            }
            let verdict = state.tracker.record(content_length, now);
            (verdict, state.tracker.stats())
        };

        if !verdict.report {
            return;
        }
        if verdict.severity >= Severity::High {
            log_warn!("clipboard: {}", verdict.reason);
        }

        let event = ProctorEvent::new(
            ProctorEventType::ClipboardPasteDetected,
            verdict.severity,
            verdict.reason.clone(),
        )
        .with_field("contentLength", content_length)
        .with_field("pasteCount", stats.paste_count)
        .with_field("totalPastedChars", stats.total_pasted_chars);

        if self.emitter.emit(event).await.is_some() && verdict.severity >= Severity::High {
            if let Some(hook) = &self.on_violation {
                hook(content_length);
            }
        }
    }
}
