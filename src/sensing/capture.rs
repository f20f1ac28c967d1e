use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Declared settings of a live capture track. Browsers omit fields they do
/// not know, hence the options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    /// `monitor`, `window` or `browser`.
    pub display_surface: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Live,
    Ended,
}

/// A screen-capture video track.
#[async_trait]
pub trait CaptureTrack: Send + Sync {
    fn id(&self) -> String;

    fn label(&self) -> String;

    fn settings(&self) -> TrackSettings;

    fn muted(&self) -> bool;

    fn ready_state(&self) -> ReadyState;

    /// Stops the track. Does not resolve `wait_ended`, matching the browser
    /// which only fires `ended` when the user or the platform ends capture.
    fn stop(&self);

    /// Resolves when capture is ended from outside the page (the browser's
    /// "stop sharing" control).
    async fn wait_ended(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub display_surface: Option<String>,
    pub cursor: String,
    pub audio: bool,
}

impl CaptureRequest {
    /// Whole-monitor capture hint, cursor always visible, no audio.
    pub fn monitor() -> Self {
        Self {
            display_surface: Some("monitor".into()),
            cursor: "always".into(),
            audio: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("screen capture is not supported in this runtime")]
    NotSupported,
    /// Carries the platform's error name (`NotAllowedError`, ...).
    #[error("screen capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("screen capture failed: {0}")]
    Failed(String),
}

impl CaptureError {
    /// Short reason reported with `screen_share_denied`.
    pub fn name(&self) -> &str {
        match self {
            CaptureError::NotSupported => "not_supported",
            CaptureError::PermissionDenied(name) => name,
            CaptureError::Failed(_) => "denied",
        }
    }
}

#[async_trait]
pub trait DisplayCapture: Send + Sync {
    async fn request_display(
        &self,
        request: &CaptureRequest,
    ) -> Result<Arc<dyn CaptureTrack>, CaptureError>;
}
