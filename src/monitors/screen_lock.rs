use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use crate::{
    config::ScreenLockConfig,
    emitter::{EventEmitter, RateLimiter},
    models::{ProctorEvent, ProctorEventType, Severity},
    sensing::{CaptureTrack, PeriodicTask, ReadyState, TrackSettings, WindowProbe},
};

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Geometry and identity of the shared surface at the moment sharing began.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScreenBaseline {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub pixel_ratio: f64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub label: String,
    pub display_surface: Option<String>,
    pub frame_rate: Option<f64>,
    pub track_id: String,
}

impl ScreenBaseline {
    /// `None` when the track does not declare a usable resolution yet.
    pub fn capture(track: &dyn CaptureTrack, window: &dyn WindowProbe) -> Option<Self> {
        let settings = track.settings();
        let width = settings.width.filter(|w| *w > 0)?;
        let height = settings.height.filter(|h| *h > 0)?;
        let metrics = window.metrics();
        Some(Self {
            width,
            height,
            aspect_ratio: width as f64 / height as f64,
            pixel_ratio: metrics.device_pixel_ratio,
            viewport_width: metrics.inner_width,
            viewport_height: metrics.inner_height,
            label: track.label(),
            display_surface: settings.display_surface,
            frame_rate: settings.frame_rate,
            track_id: track.id(),
        })
    }
}

/// What the poller reads off the live track each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub label: String,
    pub settings: TrackSettings,
    pub muted: bool,
    pub ready_state: ReadyState,
}

impl TrackSnapshot {
    pub fn read(track: &dyn CaptureTrack) -> Self {
        Self {
            label: track.label(),
            settings: track.settings(),
            muted: track.muted(),
            ready_state: track.ready_state(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextViolation {
    LabelChanged,
    SurfaceChanged,
    ResolutionMismatch,
    TrackMuted,
    TrackEnded,
}

impl ContextViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            ContextViolation::LabelChanged => "Source Changed (Label Mismatch)",
            ContextViolation::SurfaceChanged => "Source Type Changed",
            ContextViolation::ResolutionMismatch => "Resolution Mismatch > 5%",
            ContextViolation::TrackMuted => "Screen Track Muted",
            ContextViolation::TrackEnded => "Screen Track Ended Unexpectedly",
        }
    }

    fn is_source_drift(&self) -> bool {
        matches!(
            self,
            ContextViolation::LabelChanged
                | ContextViolation::SurfaceChanged
                | ContextViolation::ResolutionMismatch
        )
    }
}

fn relative_drift(current: u32, baseline: u32) -> f64 {
    current.abs_diff(baseline) as f64 / baseline as f64
}

/// At most one source-drift violation (label, then surface, then resolution)
/// plus at most one track-health violation (muted, then ended).
pub fn detect_violations(
    baseline: &ScreenBaseline,
    current: &TrackSnapshot,
    tolerance: f64,
) -> Vec<ContextViolation> {
    let mut violations = Vec::new();

    let width = current.settings.width.unwrap_or(0);
    let height = current.settings.height.unwrap_or(0);
    let resolution_changed = relative_drift(width, baseline.width) > tolerance
        || relative_drift(height, baseline.height) > tolerance;
    let label_changed = current.label != baseline.label;
    let surface_changed = baseline.display_surface.is_some()
        && current.settings.display_surface != baseline.display_surface;

    if label_changed {
        violations.push(ContextViolation::LabelChanged);
    } else if surface_changed {
        violations.push(ContextViolation::SurfaceChanged);
    } else if resolution_changed {
        violations.push(ContextViolation::ResolutionMismatch);
    }

    if current.muted {
        violations.push(ContextViolation::TrackMuted);
    } else if current.ready_state == ReadyState::Ended {
        violations.push(ContextViolation::TrackEnded);
    }

    violations
}

struct LockState {
    baseline: Option<ScreenBaseline>,
    track: Option<Arc<dyn CaptureTrack>>,
    limiter: RateLimiter<ContextViolation>,
    violation_count: u32,
}

struct LockInner {
    emitter: EventEmitter,
    config: ScreenLockConfig,
    window: Arc<dyn WindowProbe>,
    state: Mutex<LockState>,
}

impl LockInner {
    async fn check(&self) {
        if !self.emitter.context().is_active() {
            return;
        }
        let now = self.emitter.clock().now_ms();
        let (baseline, snapshot, violations) = {
            let mut state = lock(&self.state);
            let (Some(baseline), Some(track)) = (state.baseline.clone(), state.track.clone()) else {
                return;
            };
            let snapshot = TrackSnapshot::read(track.as_ref());
            let violations: Vec<ContextViolation> =
                detect_violations(&baseline, &snapshot, self.config.resolution_tolerance)
                    .into_iter()
                    .filter(|violation| state.limiter.permit(*violation, now))
                    .collect();
            state.violation_count += violations.len() as u32;
            (baseline, snapshot, violations)
        };

        for violation in violations {
            log_warn!("screen context violation: {}", violation.reason());
            let mut event = ProctorEvent::new(
                ProctorEventType::ScreenContextViolation,
                Severity::Critical,
                violation.reason(),
            )
            .with_field("reason", violation.reason());

            if violation.is_source_drift() {
                event = event
                    .with_field(
                        "baseline",
                        json!({
                            "res": format!("{}x{}", baseline.width, baseline.height),
                            "label": baseline.label,
                            "surface": baseline.display_surface,
                        }),
                    )
                    .with_field(
                        "current",
                        json!({
                            "res": format!(
                                "{}x{}",
                                snapshot.settings.width.unwrap_or(0),
                                snapshot.settings.height.unwrap_or(0)
                            ),
                            "label": snapshot.label,
                            "surface": snapshot.settings.display_surface,
                        }),
                    );
            }
            self.emitter.emit(event).await;
        }
    }
}

/// Freezes the declared geometry of a screen-share track and polls it for
/// drift while the share lasts.
pub struct ScreenShareContextLock {
    inner: Arc<LockInner>,
    poller: Mutex<PeriodicTask>,
}

impl ScreenShareContextLock {
    pub fn new(emitter: EventEmitter, config: ScreenLockConfig, window: Arc<dyn WindowProbe>) -> Self {
        let limiter = RateLimiter::new(config.report_interval_ms);
        Self {
            inner: Arc::new(LockInner {
                emitter,
                config,
                window,
                state: Mutex::new(LockState {
                    baseline: None,
                    track: None,
                    limiter,
                    violation_count: 0,
                }),
            }),
            poller: Mutex::new(PeriodicTask::new("screen-context-poll")),
        }
    }

    /// Start watching `track`. Replaces any previous baseline. Returns the new
    /// baseline, or `None` when the track has no usable geometry (nothing is
    /// polled in that case).
    pub async fn engage(&self, track: Arc<dyn CaptureTrack>) -> Result<Option<ScreenBaseline>> {
        self.release();

        let Some(baseline) = ScreenBaseline::capture(track.as_ref(), self.inner.window.as_ref())
        else {
            log_warn!("screen track {} has no declared resolution; context lock idle", track.id());
            return Ok(None);
        };

        {
            let mut state = lock(&self.inner.state);
            state.baseline = Some(baseline.clone());
            state.track = Some(track);
            state.limiter.clear();
        }

        let inner = self.inner.clone();
        let period = Duration::from_millis(self.inner.config.poll_ms);
        lock(&self.poller).start(period, move || {
            let inner = inner.clone();
            async move { inner.check().await }
        })?;

        log_info!(
            "screen context locked at {}x{} ({})",
            baseline.width,
            baseline.height,
            baseline.label
        );
        let event = ProctorEvent::new(
            ProctorEventType::ScreenContextBaselineLocked,
            Severity::Low,
            "Screen context baseline locked",
        )
        .with_field("baseline", &baseline);
        self.inner.emitter.emit(event).await;

        Ok(Some(baseline))
    }

    /// Stops polling and drops the baseline and the track reference.
    /// Idempotent. Does not stop the track itself.
    pub fn release(&self) {
        lock(&self.poller).stop();
        let mut state = lock(&self.inner.state);
        state.baseline = None;
        state.track = None;
    }

    pub fn baseline(&self) -> Option<ScreenBaseline> {
        lock(&self.inner.state).baseline.clone()
    }

    pub fn is_engaged(&self) -> bool {
        lock(&self.inner.state).track.is_some()
    }

    pub fn violation_count(&self) -> u32 {
        lock(&self.inner.state).violation_count
    }
}
