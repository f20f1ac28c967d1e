use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use crate::{
    config::ExtensionConfig,
    emitter::{EventEmitter, RateLimiter},
    models::{ProctorEvent, ProctorEventType, Severity},
    sensing::PeriodicTask,
};

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Snapshot of an element as reported by the host's mutation observer, with
/// computed style already resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DomElement {
    pub tag_name: String,
    pub id: String,
    pub class_name: String,
    pub has_shadow_root: bool,
    /// `None` when the computed z-index is `auto`.
    pub z_index: Option<i64>,
    pub offset_width: u32,
    pub offset_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomMutation {
    ChildList { added: Vec<DomElement> },
    Attributes { target: DomElement, attribute: String },
}

/// Leaked extension runtime handle in the page's global scope.
pub trait RuntimeProbe: Send + Sync {
    fn extension_runtime_id(&self) -> Option<String>;
}

pub trait PageControl: Send + Sync {
    /// Last-resort enforcement once an extension may have tampered with the page.
    fn hard_reload(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionFinding {
    ShadowRoot {
        tag_name: String,
        id: String,
        class_name: String,
    },
    HighZIndexPanel {
        tag_name: String,
        id: String,
        class_name: String,
        z_index: i64,
        dims: String,
    },
    KnownSignature { id: String, class_name: String },
    RuntimeLeak,
}

impl ExtensionFinding {
    pub fn reason(&self) -> &'static str {
        match self {
            ExtensionFinding::ShadowRoot { .. } => "Shadow Root Injection",
            ExtensionFinding::HighZIndexPanel { .. } => "Suspicious High Z-Index Element",
            ExtensionFinding::KnownSignature { .. } => "Suspicious Extension UI Detected",
            ExtensionFinding::RuntimeLeak => "Chrome Runtime Leaked",
        }
    }

    fn into_event(self) -> ProctorEvent {
        let event = ProctorEvent::new(
            ProctorEventType::ExtensionDetected,
            Severity::High,
            self.reason(),
        )
        .with_field("reason", self.reason());

        match self {
            ExtensionFinding::ShadowRoot {
                tag_name,
                id,
                class_name,
            } => event
                .with_field("tagName", tag_name)
                .with_field("id", id)
                .with_field("className", class_name),
            ExtensionFinding::HighZIndexPanel {
                tag_name,
                id,
                class_name,
                z_index,
                dims,
            } => event
                .with_field("tagName", tag_name)
                .with_field("id", id)
                .with_field("className", class_name)
                .with_field("zIndex", z_index)
                .with_field("dims", dims),
            ExtensionFinding::KnownSignature { id, class_name } => {
                event.with_field("id", id).with_field("className", class_name)
            }
            ExtensionFinding::RuntimeLeak => event,
        }
    }

    /// Identity of the offending node, so two distinct injections never
    /// share a window.
    fn dedup_key(&self) -> String {
        match self {
            ExtensionFinding::ShadowRoot {
                tag_name,
                id,
                class_name,
            } => format!("shadow:{tag_name}#{id}.{class_name}"),
            ExtensionFinding::HighZIndexPanel {
                tag_name,
                id,
                class_name,
                z_index,
                dims,
            } => format!("zindex:{tag_name}#{id}.{class_name}:{z_index}:{dims}"),
            ExtensionFinding::KnownSignature { id, class_name } => {
                format!("signature:{id}:{class_name}")
            }
            ExtensionFinding::RuntimeLeak => "runtime".to_string(),
        }
    }
}

/// Runs the three DOM heuristics against one element. An element can trip
/// more than one of them.
pub fn inspect_element(config: &ExtensionConfig, element: &DomElement) -> Vec<ExtensionFinding> {
    let mut findings = Vec::new();

    if element.has_shadow_root {
        findings.push(ExtensionFinding::ShadowRoot {
            tag_name: element.tag_name.clone(),
            id: element.id.clone(),
            class_name: element.class_name.clone(),
        });
    }

    if let Some(z_index) = element.z_index {
        let is_iframe = element.tag_name.eq_ignore_ascii_case("iframe");
        let panel_shaped = element.offset_width < config.panel_max_width
            && element.offset_height > config.panel_min_height;
        if z_index > config.z_index_threshold
            && element.id != config.own_overlay_id
            && (is_iframe || panel_shaped)
        {
            findings.push(ExtensionFinding::HighZIndexPanel {
                tag_name: element.tag_name.clone(),
                id: element.id.clone(),
                class_name: element.class_name.clone(),
                z_index,
                dims: format!("{}x{}", element.offset_width, element.offset_height),
            });
        }
    }

    let id = element.id.to_lowercase();
    let class_name = element.class_name.to_lowercase();
    let id_hit = config
        .id_signatures
        .iter()
        .any(|sig| id.contains(&sig.to_lowercase()));
    let class_hit = config
        .class_signatures
        .iter()
        .any(|sig| class_name.contains(&sig.to_lowercase()));
    if id_hit || class_hit {
        findings.push(ExtensionFinding::KnownSignature { id, class_name });
    }

    findings
}

struct ExtensionState {
    active: bool,
    limiter: RateLimiter<String>,
    violation_count: u32,
}

struct ExtensionInner {
    emitter: EventEmitter,
    config: ExtensionConfig,
    runtime: Arc<dyn RuntimeProbe>,
    page: Arc<dyn PageControl>,
    state: Mutex<ExtensionState>,
}

impl ExtensionInner {
    async fn report(&self, finding: ExtensionFinding) {
        if !self.emitter.context().is_active() {
            return;
        }
        let now = self.emitter.clock().now_ms();
        {
            let mut state = lock(&self.state);
            if !state.active || !state.limiter.permit(finding.dedup_key(), now) {
                return;
            }
            state.violation_count += 1;
        }

        log_warn!("extension detector: {}", finding.reason());
        let response = self.emitter.emit(finding.into_event()).await;
        if response.map(|r| r.terminated).unwrap_or(false) {
            log_warn!("termination after extension detection; forcing page reload");
            self.page.hard_reload();
        }
    }

    async fn check_runtime(&self) {
        if self.runtime.extension_runtime_id().is_some() {
            self.report(ExtensionFinding::RuntimeLeak).await;
        }
    }
}

/// Watches the DOM for injected extension UI and polls for a leaked
/// extension runtime.
pub struct ExtensionMonitor {
    inner: Arc<ExtensionInner>,
    poller: Mutex<PeriodicTask>,
}

impl ExtensionMonitor {
    pub fn new(
        emitter: EventEmitter,
        config: ExtensionConfig,
        runtime: Arc<dyn RuntimeProbe>,
        page: Arc<dyn PageControl>,
    ) -> Self {
        let limiter = RateLimiter::new(config.report_interval_ms);
        Self {
            inner: Arc::new(ExtensionInner {
                emitter,
                config,
                runtime,
                page,
                state: Mutex::new(ExtensionState {
                    active: false,
                    limiter,
                    violation_count: 0,
                }),
            }),
            poller: Mutex::new(PeriodicTask::new("extension-runtime-poll")),
        }
    }

    pub fn activate(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.active {
                return Ok(());
            }
            state.active = true;
        }

        let inner = self.inner.clone();
        let period = Duration::from_millis(self.inner.config.runtime_poll_ms);
        lock(&self.poller).start(period, move || {
            let inner = inner.clone();
            async move { inner.check_runtime().await }
        })?;
        log_info!(
            "extension detector active for session {}",
            self.inner.emitter.context().session_id()
        );
        Ok(())
    }

    pub fn deactivate(&self) {
        lock(&self.inner.state).active = false;
        lock(&self.poller).stop();
    }

    pub fn violation_count(&self) -> u32 {
        lock(&self.inner.state).violation_count
    }

    pub async fn on_mutations(&self, mutations: &[DomMutation]) {
        for mutation in mutations {
            let elements: &[DomElement] = match mutation {
                DomMutation::ChildList { added } => added,
                DomMutation::Attributes { target, .. } => std::slice::from_ref(target),
            };
            for element in elements {
                for finding in inspect_element(&self.inner.config, element) {
                    self.inner.report(finding).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        emitter::testing::{emitter_with, RecordingSink},
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRuntime {
        leaked: AtomicBool,
    }

    impl RuntimeProbe for FakeRuntime {
        fn extension_runtime_id(&self) -> Option<String> {
            self.leaked
                .load(Ordering::SeqCst)
                .then(|| "abcdefghijklmnop".to_string())
        }
    }

    #[derive(Default)]
    struct FakePage {
        reloads: AtomicUsize,
    }

    impl PageControl for FakePage {
        fn hard_reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn element(tag: &str) -> DomElement {
        DomElement {
            tag_name: tag.into(),
            ..Default::default()
        }
    }

    fn setup() -> (ExtensionMonitor, Arc<RecordingSink>, Arc<FakeRuntime>, Arc<FakePage>) {
        let sink = RecordingSink::new();
        let (emitter, _) = emitter_with(sink.clone(), SystemClock::shared());
        let runtime = Arc::new(FakeRuntime::default());
        let page = Arc::new(FakePage::default());
        let monitor = ExtensionMonitor::new(
            emitter,
            ExtensionConfig::default(),
            runtime.clone(),
            page.clone(),
        );
        (monitor, sink, runtime, page)
    }

    #[test]
    fn shadow_root_is_flagged() {
        let el = DomElement {
            has_shadow_root: true,
            ..element("DIV")
        };
        let findings = inspect_element(&ExtensionConfig::default(), &el);
        assert_eq!(
            findings,
            vec![ExtensionFinding::ShadowRoot {
                tag_name: "DIV".into(),
                id: String::new(),
                class_name: String::new(),
            }]
        );
    }

    #[test]
    fn high_z_index_needs_panel_shape_or_iframe() {
        let config = ExtensionConfig::default();
        let panel = DomElement {
            z_index: Some(2_147_483_647),
            offset_width: 360,
            offset_height: 800,
            ..element("DIV")
        };
        let banner = DomElement {
            offset_width: 1200,
            offset_height: 80,
            ..panel.clone()
        };
        let frame = DomElement {
            offset_width: 1200,
            ..element("IFRAME")
        };
        let frame = DomElement {
            z_index: Some(10_000),
            ..frame
        };
        let own = DomElement {
            id: "security-overlay-root".into(),
            ..panel.clone()
        };

        assert_eq!(inspect_element(&config, &panel).len(), 1);
        assert!(inspect_element(&config, &banner).is_empty());
        assert_eq!(inspect_element(&config, &frame).len(), 1);
        assert!(inspect_element(&config, &own).is_empty());
    }

    #[test]
    fn signature_match_is_case_insensitive() {
        let config = ExtensionConfig::default();
        let by_id = DomElement {
            id: "ChatGPT-Helper".into(),
            ..element("DIV")
        };
        let by_class = DomElement {
            class_name: "ext Sidebar-Content".into(),
            ..element("ASIDE")
        };
        let harmless = DomElement {
            class_name: "sidebar".into(),
            ..element("NAV")
        };
        assert_eq!(inspect_element(&config, &by_id).len(), 1);
        assert_eq!(inspect_element(&config, &by_class).len(), 1);
        assert!(inspect_element(&config, &harmless).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_injection_is_reported_once_per_window() {
        let (monitor, sink, _, _) = setup();
        monitor.activate().unwrap();
        let injected = DomElement {
            has_shadow_root: true,
            ..element("DIV")
        };
        let mutation = DomMutation::ChildList {
            added: vec![injected.clone(), injected],
        };

        monitor.on_mutations(&[mutation.clone()]).await;
        assert_eq!(sink.of_type(ProctorEventType::ExtensionDetected).len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        monitor.on_mutations(&[mutation]).await;
        assert_eq!(sink.of_type(ProctorEventType::ExtensionDetected).len(), 2);
        assert_eq!(monitor.violation_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_injections_are_reported_separately() {
        let (monitor, sink, _, _) = setup();
        monitor.activate().unwrap();
        let shadow_host = |id: &str| DomElement {
            id: id.into(),
            has_shadow_root: true,
            ..element("DIV")
        };

        monitor
            .on_mutations(&[DomMutation::ChildList {
                added: vec![shadow_host("grammar-helper")],
            }])
            .await;
        tokio::time::advance(Duration::from_secs(1)).await;
        monitor
            .on_mutations(&[DomMutation::ChildList {
                added: vec![shadow_host("ai-answer-overlay")],
            }])
            .await;

        let events = sink.of_type(ProctorEventType::ExtensionDetected);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["id"], "grammar-helper");
        assert_eq!(events[1].payload["id"], "ai-answer-overlay");

        let panel = |z: i64| DomElement {
            z_index: Some(z),
            offset_width: 360,
            offset_height: 800,
            ..element("DIV")
        };
        monitor
            .on_mutations(&[DomMutation::ChildList {
                added: vec![
                    DomElement {
                        class_name: "panel-a".into(),
                        ..panel(99_999)
                    },
                    DomElement {
                        class_name: "panel-b".into(),
                        ..panel(99_999)
                    },
                ],
            }])
            .await;
        assert_eq!(sink.of_type(ProctorEventType::ExtensionDetected).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn attribute_change_can_reveal_overlay() {
        let (monitor, sink, _, _) = setup();
        monitor.activate().unwrap();
        let target = DomElement {
            class_name: "sidebar-content".into(),
            ..element("DIV")
        };
        monitor
            .on_mutations(&[DomMutation::Attributes {
                target,
                attribute: "class".into(),
            }])
            .await;
        let events = sink.of_type(ProctorEventType::ExtensionDetected);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["severity"], "high");
        assert_eq!(events[0].payload["className"], "sidebar-content");
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_leak_polled_every_five_seconds() {
        let (monitor, sink, runtime, _) = setup();
        monitor.activate().unwrap();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(sink.count(), 0);

        runtime.leaked.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        let events = sink.of_type(ProctorEventType::ExtensionDetected);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["reason"], "Chrome Runtime Leaked");
    }

    #[tokio::test(start_paused = true)]
    async fn termination_forces_reload() {
        let (monitor, sink, _, page) = setup();
        sink.terminate_on(ProctorEventType::ExtensionDetected);
        monitor.activate().unwrap();
        monitor
            .on_mutations(&[DomMutation::ChildList {
                added: vec![DomElement {
                    id: "copilot-root".into(),
                    ..element("DIV")
                }],
            }])
            .await;
        assert_eq!(page.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_stops_poll_and_observation() {
        let (monitor, sink, runtime, _) = setup();
        monitor.activate().unwrap();
        runtime.leaked.store(true, Ordering::SeqCst);
        monitor.deactivate();
        monitor.deactivate();

        tokio::time::sleep(Duration::from_secs(30)).await;
        monitor
            .on_mutations(&[DomMutation::ChildList {
                added: vec![DomElement {
                    has_shadow_root: true,
                    ..element("DIV")
                }],
            }])
            .await;
        assert_eq!(sink.count(), 0);
    }
}
