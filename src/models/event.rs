use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProctorEventType {
    TabSwitch,
    FullscreenExit,
    FocusLost,
    FocusLostWhileScreenSharing,
    ClipboardPasteDetected,
    ExtensionDetected,
    KeystrokeAnomaly,
    KeystrokeBaselineEstablished,
    AiApiDetected,
    ScreenContextBaselineLocked,
    ScreenContextViolation,
    ScreenShareStarted,
    ScreenShareStopped,
    ScreenShareInterrupted,
    ScreenShareDenied,
    MultipleTestTabsDetected,
    DevtoolsAttempt,
    SourceViewAttempt,
    ScreenshotAttempt,
    ViewportCompromised,
    FaceMissing,
    MultipleFaces,
}

impl ProctorEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProctorEventType::TabSwitch => "tab_switch",
            ProctorEventType::FullscreenExit => "fullscreen_exit",
            ProctorEventType::FocusLost => "focus_lost",
            ProctorEventType::FocusLostWhileScreenSharing => "focus_lost_while_screen_sharing",
            ProctorEventType::ClipboardPasteDetected => "clipboard_paste_detected",
            ProctorEventType::ExtensionDetected => "extension_detected",
            ProctorEventType::KeystrokeAnomaly => "keystroke_anomaly",
            ProctorEventType::KeystrokeBaselineEstablished => "keystroke_baseline_established",
            ProctorEventType::AiApiDetected => "ai_api_detected",
            ProctorEventType::ScreenContextBaselineLocked => "screen_context_baseline_locked",
            ProctorEventType::ScreenContextViolation => "screen_context_violation",
            ProctorEventType::ScreenShareStarted => "screen_share_started",
            ProctorEventType::ScreenShareStopped => "screen_share_stopped",
            ProctorEventType::ScreenShareInterrupted => "screen_share_interrupted",
            ProctorEventType::ScreenShareDenied => "screen_share_denied",
            ProctorEventType::MultipleTestTabsDetected => "multiple_test_tabs_detected",
            ProctorEventType::DevtoolsAttempt => "devtools_attempt",
            ProctorEventType::SourceViewAttempt => "source_view_attempt",
            ProctorEventType::ScreenshotAttempt => "screenshot_attempt",
            ProctorEventType::ViewportCompromised => "viewport_compromised",
            ProctorEventType::FaceMissing => "face_missing",
            ProctorEventType::MultipleFaces => "multiple_faces",
        }
    }

    /// Severity used when a violation reaches the backend through the host
    /// coordinator rather than from a monitor with its own classification.
    pub fn default_severity(&self) -> Severity {
        match self {
            ProctorEventType::KeystrokeBaselineEstablished
            | ProctorEventType::ScreenContextBaselineLocked
            | ProctorEventType::ScreenShareStarted
            | ProctorEventType::ScreenShareStopped => Severity::Low,
            ProctorEventType::TabSwitch
            | ProctorEventType::FullscreenExit
            | ProctorEventType::FocusLost
            | ProctorEventType::FocusLostWhileScreenSharing
            | ProctorEventType::ScreenShareDenied
            | ProctorEventType::SourceViewAttempt
            | ProctorEventType::ViewportCompromised
            | ProctorEventType::KeystrokeAnomaly
            | ProctorEventType::ClipboardPasteDetected => Severity::Medium,
            ProctorEventType::ExtensionDetected
            | ProctorEventType::ScreenShareInterrupted
            | ProctorEventType::MultipleTestTabsDetected
            | ProctorEventType::DevtoolsAttempt
            | ProctorEventType::ScreenshotAttempt
            | ProctorEventType::FaceMissing
            | ProctorEventType::MultipleFaces => Severity::High,
            ProctorEventType::AiApiDetected | ProctorEventType::ScreenContextViolation => {
                Severity::Critical
            }
        }
    }
}

impl fmt::Display for ProctorEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified observation, before it is stamped and put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ProctorEvent {
    pub event_type: ProctorEventType,
    pub severity: Severity,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl ProctorEvent {
    pub fn new(event_type: ProctorEventType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            event_type,
            severity,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Serialize) -> Self {
        // Serializing plain data into a Value only fails for maps with
        // non-string keys, which no caller builds.
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Wire payload: `{event_id, timestamp, severity, message, ...fields}`.
    /// Monitor fields never overwrite the four envelope keys.
    pub fn to_payload(&self, timestamp: DateTime<Utc>) -> Value {
        let mut payload = self.fields.clone();
        payload.insert("event_id".into(), Value::String(Uuid::new_v4().to_string()));
        payload.insert(
            "timestamp".into(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        payload.insert("severity".into(), Value::String(self.severity.as_str().into()));
        payload.insert("message".into(), Value::String(self.message.clone()));
        Value::Object(payload)
    }
}
