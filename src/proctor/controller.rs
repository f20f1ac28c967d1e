use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tokio::{task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::SharedClock,
    config::{ProctorConfig, SessionPolicyConfig},
    emitter::{EventEmitter, EventSink, SinkResponse},
    models::{ProctorEvent, ProctorEventType, SessionContext, SessionStatus, Terminator},
    monitors::{
        lock, BroadcastHub, ClipboardMonitor, ClipboardWriter, ExtensionMonitor,
        FaceDetectionMonitor, FaceDetector, FaceSignalHandler, KeystrokeDynamicsMonitor,
        NetworkMonitor, PageControl, RuntimeProbe, ScreenShareContextLock, ScreenShareProctor,
        SingleTabEnforcer, SystemIntegrityMonitor, VideoFeed, ViolationSink, VisibilityMonitor,
        WarningDisplay,
    },
    sensing::{DisplayCapture, WindowProbe},
};

use super::ProctorState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const FACE_MISSING_MESSAGE: &str = "Face not detected. Please stay in front of the camera.";
const MULTIPLE_TABS_MESSAGE: &str =
    "Test is already open in another tab. This instance is restricted.";

/// Camera side of the host, only present when the attempt requires it.
pub struct FaceCapabilities {
    pub detector: Arc<dyn FaceDetector>,
    pub feed: Arc<dyn VideoFeed>,
}

/// Everything the engine needs from the page it runs in.
pub struct ProctorCapabilities {
    pub sink: Arc<dyn EventSink>,
    pub clock: SharedClock,
    pub warnings: Arc<dyn WarningDisplay>,
    pub window: Arc<dyn WindowProbe>,
    pub display: Arc<dyn DisplayCapture>,
    pub clipboard: Arc<dyn ClipboardWriter>,
    pub runtime: Arc<dyn RuntimeProbe>,
    pub page: Arc<dyn PageControl>,
    pub tabs: Arc<dyn BroadcastHub>,
    pub camera: Option<FaceCapabilities>,
}

/// The host's violation policy: grace window, warning surface and the
/// face/tab thresholds. Shared by every monitor that signals upwards.
#[derive(Clone)]
struct ViolationPolicy {
    emitter: EventEmitter,
    warnings: Arc<dyn WarningDisplay>,
    config: SessionPolicyConfig,
    state: Arc<Mutex<ProctorState>>,
}

impl ViolationPolicy {
    async fn handle(
        &self,
        event_type: ProctorEventType,
        message: &str,
        fields: Map<String, Value>,
    ) -> Option<SinkResponse> {
        let now = self.emitter.clock().now_ms();
        {
            let mut state = lock(&self.state);
            if !state.is_running() {
                return None;
            }
            if event_type != ProctorEventType::DevtoolsAttempt
                && state.in_grace_period(now, self.config.grace_period_ms)
            {
                state.violations_suppressed += 1;
                log_info!("grace period: dropping {}", event_type);
                return None;
            }
            state.violations_reported += 1;
        }

        self.warnings.show_warning(message);
        let event = ProctorEvent::new(event_type, event_type.default_severity(), message)
            .with_fields(fields);
        let response = self.emitter.emit(event).await;

        if let Some(count) = response.and_then(|response| response.warning_count) {
            lock(&self.state).warning_count = count;
        }
        response
    }

    fn spawn(
        &self,
        event_type: ProctorEventType,
        message: String,
        fields: Map<String, Value>,
    ) -> JoinHandle<Option<SinkResponse>> {
        let policy = self.clone();
        tokio::spawn(async move { policy.handle(event_type, &message, fields).await })
    }

    fn multiple_tabs(&self, is_active: bool) {
        if !is_active {
            self.spawn(
                ProctorEventType::MultipleTestTabsDetected,
                MULTIPLE_TABS_MESSAGE.to_string(),
                Map::new(),
            );
        }
    }
}

impl ViolationSink for ViolationPolicy {
    fn on_violation(&self, event_type: ProctorEventType, message: &str) {
        self.spawn(event_type, message.to_string(), Map::new());
    }
}

impl FaceSignalHandler for ViolationPolicy {
    fn on_face_detected(&self, count: usize) {
        log::debug!("{count} face(s) in frame");
    }

    fn on_face_missing(&self, missing_for: Duration) {
        if missing_for.as_millis() as u64 <= self.config.face_missing_threshold_ms {
            return;
        }
        let mut fields = Map::new();
        fields.insert(
            "duration_missing_seconds".into(),
            Value::from(missing_for.as_secs_f64()),
        );
        self.spawn(ProctorEventType::FaceMissing, FACE_MISSING_MESSAGE.to_string(), fields);
    }

    fn on_multiple_faces(&self, count: usize) {
        let mut fields = Map::new();
        fields.insert("faces_count".into(), Value::from(count));
        self.spawn(
            ProctorEventType::MultipleFaces,
            format!("Multiple faces detected ({count})."),
            fields,
        );
    }
}

struct Monitors {
    visibility: VisibilityMonitor,
    clipboard: ClipboardMonitor,
    extension: ExtensionMonitor,
    keystroke: KeystrokeDynamicsMonitor,
    network: NetworkMonitor,
    screen_share: ScreenShareProctor,
    single_tab: SingleTabEnforcer,
    integrity: SystemIntegrityMonitor,
    face: Option<FaceDetectionMonitor>,
}

impl Monitors {
    fn deactivate_all(&self) {
        self.visibility.deactivate();
        self.clipboard.deactivate();
        self.extension.deactivate();
        self.keystroke.deactivate();
        self.network.deactivate();
        self.screen_share.deactivate();
        self.single_tab.deactivate();
        self.integrity.deactivate();
        if let Some(face) = &self.face {
            face.deactivate();
        }
    }
}

/// One proctored attempt: owns every monitor, applies the host policy to the
/// signals they raise and tears everything down on end or termination.
///
/// `Idle -> Running -> (Ended | Terminated)`.
pub struct ProctorController {
    emitter: EventEmitter,
    policy: ViolationPolicy,
    monitors: Arc<Monitors>,
    terminated: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProctorController {
    pub fn new(
        assignment_id: impl Into<String>,
        config: ProctorConfig,
        capabilities: ProctorCapabilities,
        on_terminate: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let assignment_id: String = assignment_id.into();
        let ProctorCapabilities {
            sink,
            clock,
            warnings,
            window,
            display,
            clipboard,
            runtime,
            page,
            tabs,
            camera,
        } = capabilities;

        let state = Arc::new(Mutex::new(ProctorState::new()));
        let terminated = CancellationToken::new();

        let terminator = {
            let state = state.clone();
            let terminated = terminated.clone();
            Terminator::new(move || {
                lock(&state).finish(SessionStatus::Terminated);
                terminated.cancel();
                on_terminate();
            })
        };
        let context = SessionContext::new(assignment_id.clone(), terminator);
        let emitter = EventEmitter::new(context, sink, clock.clone());

        let policy = ViolationPolicy {
            emitter: emitter.clone(),
            warnings: warnings.clone(),
            config: config.session.clone(),
            state,
        };

        let tab_policy = policy.clone();
        let monitors = Monitors {
            visibility: VisibilityMonitor::new(
                emitter.clone(),
                warnings,
                config.session.min_focus_loss_ms,
            ),
            clipboard: ClipboardMonitor::new(emitter.clone(), config.clipboard.clone()),
            extension: ExtensionMonitor::new(
                emitter.clone(),
                config.extension.clone(),
                runtime,
                page,
            ),
            keystroke: KeystrokeDynamicsMonitor::new(emitter.clone(), config.keystroke.clone()),
            network: NetworkMonitor::new(emitter.clone(), &config.network),
            screen_share: ScreenShareProctor::new(
                emitter.clone(),
                display,
                ScreenShareContextLock::new(
                    emitter.clone(),
                    config.screen_lock.clone(),
                    window.clone(),
                ),
            ),
            single_tab: SingleTabEnforcer::new(tabs, assignment_id, clock, move |is_active| {
                tab_policy.multiple_tabs(is_active)
            }),
            integrity: SystemIntegrityMonitor::new(
                config.integrity.clone(),
                window,
                clipboard,
                Arc::new(policy.clone()),
            ),
            face: camera.map(|camera| {
                FaceDetectionMonitor::new(
                    config.face.clone(),
                    camera.detector,
                    camera.feed,
                    Arc::new(policy.clone()),
                    emitter.clock().clone(),
                )
            }),
        };

        Self {
            emitter,
            policy,
            monitors: Arc::new(monitors),
            terminated,
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProctorState {
        lock(&self.policy.state).clone()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.policy.state).status
    }

    pub fn warning_count(&self) -> u32 {
        lock(&self.policy.state).warning_count
    }

    pub fn session(&self) -> &SessionContext {
        self.emitter.context()
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn visibility(&self) -> &VisibilityMonitor {
        &self.monitors.visibility
    }

    pub fn clipboard(&self) -> &ClipboardMonitor {
        &self.monitors.clipboard
    }

    pub fn extension(&self) -> &ExtensionMonitor {
        &self.monitors.extension
    }

    pub fn keystroke(&self) -> &KeystrokeDynamicsMonitor {
        &self.monitors.keystroke
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.monitors.network
    }

    pub fn screen_share(&self) -> &ScreenShareProctor {
        &self.monitors.screen_share
    }

    pub fn single_tab(&self) -> &SingleTabEnforcer {
        &self.monitors.single_tab
    }

    pub fn integrity(&self) -> &SystemIntegrityMonitor {
        &self.monitors.integrity
    }

    pub fn face(&self) -> Option<&FaceDetectionMonitor> {
        self.monitors.face.as_ref()
    }

    /// Activates every monitor for this attempt. Screen sharing needs a user
    /// gesture and is started separately through [`Self::start_screen_share`].
    pub async fn start(&self) -> Result<ProctorState> {
        if self.emitter.context().terminator().is_terminated() {
            bail!("session already terminated");
        }
        {
            let mut state = lock(&self.policy.state);
            if state.status != SessionStatus::Idle {
                bail!("proctoring already {}", state.status.as_str());
            }
            let clock = self.emitter.clock();
            state.begin_session(
                self.emitter.context().session_id().to_string(),
                clock.wall_clock(),
                clock.now_ms(),
            );
        }
        self.emitter.context().set_active(true);

        let monitors = &self.monitors;
        monitors.visibility.activate();
        monitors.clipboard.activate();
        monitors.keystroke.activate();
        monitors.network.activate();
        monitors.single_tab.activate();
        monitors
            .extension
            .activate()
            .context("failed to start extension monitor")?;
        monitors
            .integrity
            .activate()
            .context("failed to start system integrity monitor")?;
        if let Some(face) = &monitors.face {
            face.activate()
                .await
                .context("failed to start face detection")?;
        }

        self.spawn_termination_watcher();
        log_info!("proctoring started for {}", self.emitter.context().session_id());
        Ok(self.state())
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        if !lock(&self.policy.state).is_running() {
            bail!("no active session");
        }
        self.monitors.screen_share.start().await
    }

    /// The host's `onViolation`: applies the grace window, shows the warning
    /// and logs the event with its default severity.
    pub async fn handle_violation(
        &self,
        event_type: ProctorEventType,
        message: &str,
        fields: Map<String, Value>,
    ) -> Option<SinkResponse> {
        self.policy.handle(event_type, message, fields).await
    }

    pub fn on_multiple_tabs_detected(&self, is_active: bool) {
        self.policy.multiple_tabs(is_active);
    }

    /// Stops the share (reporting it) and deactivates every monitor.
    pub async fn end(&self) -> Result<ProctorState> {
        if !lock(&self.policy.state).is_running() {
            bail!("no active session to end");
        }
        self.monitors.screen_share.stop().await;
        self.teardown(SessionStatus::Ended);
        log_info!("proctoring ended for {}", self.emitter.context().session_id());
        Ok(self.state())
    }

    fn teardown(&self, status: SessionStatus) {
        self.emitter.context().set_active(false);
        self.monitors.deactivate_all();
        lock(&self.policy.state).finish(status);
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }

    fn spawn_termination_watcher(&self) {
        let terminated = self.terminated.clone();
        let monitors = self.monitors.clone();
        let context = self.emitter.context().clone();
        let handle = tokio::spawn(async move {
            terminated.cancelled().await;
            log_warn!("tearing down monitors for terminated session {}", context.session_id());
            context.set_active(false);
            monitors.deactivate_all();
        });
        *lock(&self.watcher) = Some(handle);
    }
}

impl Drop for ProctorController {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        self.monitors.deactivate_all();
    }
}
