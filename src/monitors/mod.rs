//! One module per observed surface. Every monitor owns its own counters and
//! rate-limit state, is activated per attempt and has an idempotent
//! `deactivate` that leaves nothing running.

pub mod clipboard;
pub mod extension;
pub mod face;
pub mod keystroke;
pub mod network;
pub mod screen_lock;
pub mod screen_share;
pub mod single_tab;
pub mod system_integrity;
pub mod visibility;

use std::sync::{Mutex, MutexGuard};

use crate::models::ProctorEventType;

pub use clipboard::{ClipboardMonitor, PasteStats, PasteTracker, PasteVerdict};
pub use extension::{DomElement, DomMutation, ExtensionMonitor, PageControl, RuntimeProbe};
pub use face::{FaceDetectionMonitor, FaceDetector, FaceSignalHandler, VideoFeed};
pub use keystroke::{KeystrokeAnalyzer, KeystrokeDynamicsMonitor, KeystrokeMetrics, KeystrokePhase};
pub use network::{NetworkMonitor, OutboundRequest, RequestIssuer, RequestKind, RequestOutcome, RestoreHandle};
pub use screen_lock::{ScreenBaseline, ScreenShareContextLock};
pub use screen_share::{ScreenShareProctor, ShareState};
pub use single_tab::{
    BroadcastHub, ChannelError, LocalBroadcastHub, SingleTabEnforcer, TabChannel, TabMessage,
    UnsupportedBroadcastHub,
};
pub use system_integrity::{ClipboardWriter, EventDisposition, KeyEvent, SystemIntegrityMonitor};
pub use visibility::{FullscreenGate, VisibilityMonitor};

/// Lock a monitor's state, recovering the data if a previous holder panicked.
/// Monitor state is plain counters and flags, always valid between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// On-screen warning surface owned by the host page.
pub trait WarningDisplay: Send + Sync {
    fn show_warning(&self, message: &str);
}

/// The host's `onViolation(type, message)` callback, for monitors that signal
/// upwards instead of logging to the backend themselves.
pub trait ViolationSink: Send + Sync {
    fn on_violation(&self, event_type: ProctorEventType, message: &str);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub struct RecordingWarnings {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingWarnings {
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl WarningDisplay for RecordingWarnings {
        fn show_warning(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    #[derive(Default)]
    pub struct RecordingViolations {
        calls: Mutex<Vec<(ProctorEventType, String)>>,
    }

    impl RecordingViolations {
        pub fn calls(&self) -> Vec<(ProctorEventType, String)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count_of(&self, event_type: ProctorEventType) -> usize {
            self.calls()
                .iter()
                .filter(|(recorded, _)| *recorded == event_type)
                .count()
        }
    }

    impl ViolationSink for RecordingViolations {
        fn on_violation(&self, event_type: ProctorEventType, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((event_type, message.to_string()));
        }
    }
}
