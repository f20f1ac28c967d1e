use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::task::JoinHandle;

use crate::{
    config::NetworkConfig,
    emitter::{EventEmitter, SeenSet},
    models::{ProctorEvent, ProctorEventType, Severity},
};

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Known AI-assistance endpoints. Entries with a path are matched against
/// host + path, the rest against the hostname alone.
pub const AI_DOMAINS: &[&str] = &[
    "api.openai.com",
    "api.anthropic.com",
    "generativelanguage.googleapis.com",
    "api.cohere.ai",
    "api.together.xyz",
    "api.replicate.com",
    "api.huggingface.co",
    "chatgpt.com",
    "chat.openai.com",
    "claude.ai",
    "bard.google.com",
    "gemini.google.com",
    "copilot.microsoft.com",
    "bing.com/chat",
    "perplexity.ai",
    "you.com",
    "phind.com",
    "codeium.com",
    "tabnine.com",
    "kite.com",
    "sourcegraph.com",
];

const MAX_REPORTED_URL_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Fetch,
    XhrOpen { method: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub kind: RequestKind,
    pub url: String,
}

impl OutboundRequest {
    pub fn fetch(url: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Fetch,
            url: url.into(),
        }
    }

    pub fn xhr_open(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::XhrOpen {
                method: method.into(),
            },
            url: url.into(),
        }
    }
}

/// Whatever the underlying primitive produced. Passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub status: Option<u16>,
    pub body: Option<String>,
}

/// The environment's request primitive (fetch, or XHR `open`).
#[async_trait]
pub trait RequestIssuer: Send + Sync {
    async fn issue(&self, request: &OutboundRequest) -> Result<RequestOutcome>;
}

/// Host and path of an absolute URL, lowercased host. Relative URLs are
/// same-origin and yield `None`. Backslashes count as slashes, as they do in
/// a browser's URL parser for web schemes.
pub fn split_url(url: &str) -> Option<(String, String)> {
    let normalized = url.trim().replace('\\', "/");
    let url = normalized.as_str();
    let scheme_end = url.find("://").filter(|idx| {
        let scheme = &url[..*idx];
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    });
    let rest = match scheme_end {
        Some(idx) => &url[idx + 3..],
        None => url.strip_prefix("//")?,
    };

    let authority_end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    if host.is_empty() {
        return None;
    }

    let tail = &rest[authority_end..];
    let path_end = tail.find(&['?', '#'][..]).unwrap_or(tail.len());
    Some((host.to_ascii_lowercase(), tail[..path_end].to_string()))
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

type DomainHook = Arc<dyn Fn(&str) + Send + Sync>;

struct NetworkState {
    active: bool,
    reported: SeenSet<String>,
}

struct NetworkInner {
    emitter: EventEmitter,
    denylist: Vec<String>,
    state: Mutex<NetworkState>,
    on_violation: Option<DomainHook>,
}

impl NetworkInner {
    fn matching_entry(&self, url: &str) -> Option<&str> {
        let (host, path) = split_url(url)?;
        let host_and_path = format!("{host}{path}");
        self.denylist
            .iter()
            .find(|entry| {
                if entry.contains('/') {
                    host_and_path.contains(entry.as_str())
                } else {
                    host.contains(entry.as_str())
                }
            })
            .map(String::as_str)
    }

    fn check_url(&self, url: &str) -> Option<JoinHandle<()>> {
        if !self.emitter.context().is_active() {
            return None;
        }
        let domain = self.matching_entry(url)?.to_string();
        {
            let mut state = lock(&self.state);
            if !state.active || !state.reported.first_sighting(domain.clone()) {
                return None;
            }
        }

        log_warn!("network monitor: request to suspicious domain {}", domain);
        let event = ProctorEvent::new(
            ProctorEventType::AiApiDetected,
            Severity::Critical,
            format!("Detected network request to AI service: {domain}"),
        )
        .with_field("domain", &domain)
        .with_field("url", truncate_chars(url, MAX_REPORTED_URL_CHARS));

        let emitter = self.emitter.clone();
        let hook = self.on_violation.clone();
        Some(tokio::spawn(async move {
            if emitter.emit(event).await.is_some() {
                if let Some(hook) = hook {
                    hook(&domain);
                }
            }
        }))
    }
}

/// Wraps a request primitive so every URL is inspected before the original
/// call runs. Requests and responses pass through unchanged.
pub struct InterceptedIssuer {
    inner: Arc<dyn RequestIssuer>,
    monitor: Arc<NetworkInner>,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl RequestIssuer for InterceptedIssuer {
    async fn issue(&self, request: &OutboundRequest) -> Result<RequestOutcome> {
        if self.armed.load(Ordering::SeqCst) {
            // Reporting runs on its own task; the request is not held up.
            let _ = self.monitor.check_url(&request.url);
        }
        self.inner.issue(request).await
    }
}

/// Undo handle returned by [`NetworkMonitor::intercept`].
pub struct RestoreHandle {
    original: Arc<dyn RequestIssuer>,
    armed: Arc<AtomicBool>,
}

impl RestoreHandle {
    /// Disarms the wrapper and hands back the original primitive.
    pub fn restore(self) -> Arc<dyn RequestIssuer> {
        self.armed.store(false, Ordering::SeqCst);
        self.original
    }
}

/// Flags outbound requests to AI-assistance domains. Each domain is reported
/// once per session.
pub struct NetworkMonitor {
    inner: Arc<NetworkInner>,
}

impl NetworkMonitor {
    pub fn new(emitter: EventEmitter, config: &NetworkConfig) -> Self {
        Self::build(emitter, config, None)
    }

    /// Host hook called with the matched domain after the event is logged.
    pub fn with_violation_hook(
        emitter: EventEmitter,
        config: &NetworkConfig,
        hook: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self::build(emitter, config, Some(Arc::new(hook)))
    }

    fn build(emitter: EventEmitter, config: &NetworkConfig, hook: Option<DomainHook>) -> Self {
        let denylist = AI_DOMAINS
            .iter()
            .map(|domain| domain.to_string())
            .chain(config.extra_domains.iter().map(|d| d.trim().to_ascii_lowercase()))
            .filter(|domain| !domain.is_empty())
            .collect();
        Self {
            inner: Arc::new(NetworkInner {
                emitter,
                denylist,
                state: Mutex::new(NetworkState {
                    active: false,
                    reported: SeenSet::new(),
                }),
                on_violation: hook,
            }),
        }
    }

    pub fn activate(&self) {
        lock(&self.inner.state).active = true;
        log_info!(
            "network monitor active for session {}",
            self.inner.emitter.context().session_id()
        );
    }

    pub fn deactivate(&self) {
        lock(&self.inner.state).active = false;
    }

    pub fn detected_domains(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        let mut domains: Vec<String> = state.reported.iter().cloned().collect();
        domains.sort();
        domains
    }

    /// Inspect a URL directly. Returns the reporting task when it matched a
    /// domain not yet reported this session.
    pub fn check_url(&self, url: &str) -> Option<JoinHandle<()>> {
        self.inner.check_url(url)
    }

    pub fn intercept(&self, inner: Arc<dyn RequestIssuer>) -> (Arc<InterceptedIssuer>, RestoreHandle) {
        let armed = Arc::new(AtomicBool::new(true));
        let wrapped = Arc::new(InterceptedIssuer {
            inner: inner.clone(),
            monitor: self.inner.clone(),
            armed: armed.clone(),
        });
        (
            wrapped,
            RestoreHandle {
                original: inner,
                armed,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        emitter::testing::{emitter_with, RecordingSink},
    };
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Duration;

    struct EchoIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestIssuer for EchoIssuer {
        async fn issue(&self, request: &OutboundRequest) -> Result<RequestOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.url.contains("fail") {
                anyhow::bail!("connection refused");
            }
            Ok(RequestOutcome {
                status: Some(200),
                body: Some(request.url.clone()),
            })
        }
    }

    fn monitor_with(config: NetworkConfig) -> (NetworkMonitor, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let (emitter, _) = emitter_with(sink.clone(), SystemClock::shared());
        let monitor = NetworkMonitor::new(emitter, &config);
        monitor.activate();
        (monitor, sink)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn split_url_variants() {
        assert_eq!(
            split_url("https://API.OpenAI.com:443/v1/chat?x=1"),
            Some(("api.openai.com".into(), "/v1/chat".into()))
        );
        assert_eq!(
            split_url("//user:pw@claude.ai#frag"),
            Some(("claude.ai".into(), "".into()))
        );
        assert_eq!(
            split_url("http://[::1]:8080/x"),
            Some(("::1".into(), "/x".into()))
        );
        assert_eq!(split_url("/api/submit"), None);
        assert_eq!(split_url("/go?next=https://claude.ai"), None);
        assert_eq!(
            split_url(" https:\\\\www.Bing.com\\chat?q=1"),
            Some(("www.bing.com".into(), "/chat".into()))
        );
        assert_eq!(split_url("https:///nohost"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ai_host_reported_once_per_session() {
        let (monitor, sink) = monitor_with(NetworkConfig::default());

        monitor
            .check_url("https://api.openai.com/v1/chat")
            .expect("first sighting reports")
            .await
            .unwrap();
        assert!(monitor.check_url("https://api.openai.com/v1/embeddings").is_none());
        assert!(monitor.check_url("https://example.com").is_none());

        let events = sink.of_type(ProctorEventType::AiApiDetected);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["severity"], "critical");
        assert_eq!(events[0].payload["domain"], "api.openai.com");
        assert_eq!(monitor.detected_domains(), vec!["api.openai.com".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn subdomains_and_path_entries_match() {
        let (monitor, sink) = monitor_with(NetworkConfig::default());
        monitor.check_url("https://eu.claude.ai/chat").unwrap().await.unwrap();
        monitor.check_url("https://www.bing.com/chat?q=x").unwrap().await.unwrap();
        assert!(monitor.check_url("https://www.bing.com/search?q=x").is_none());

        let domains: Vec<_> = sink
            .events()
            .iter()
            .map(|e| e.payload["domain"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(domains, vec!["claude.ai", "bing.com/chat"]);
    }

    #[tokio::test(start_paused = true)]
    async fn backslash_path_still_matches_path_entry() {
        let (monitor, sink) = monitor_with(NetworkConfig::default());
        monitor
            .check_url("https://www.bing.com\\chat")
            .expect("backslash is a path separator")
            .await
            .unwrap();
        assert_eq!(sink.events()[0].payload["domain"], "bing.com/chat");
    }

    #[tokio::test(start_paused = true)]
    async fn extra_domains_extend_denylist() {
        let config = NetworkConfig {
            extra_domains: vec![" Cheat.Example ".into()],
        };
        let (monitor, sink) = monitor_with(config);
        monitor.check_url("https://api.cheat.example/x").unwrap().await.unwrap();
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_urls_are_truncated() {
        let (monitor, sink) = monitor_with(NetworkConfig::default());
        let url = format!("https://chatgpt.com/{}", "a".repeat(500));
        monitor.check_url(&url).unwrap().await.unwrap();
        let reported = sink.events()[0].payload["url"].as_str().unwrap().to_string();
        assert_eq!(reported.chars().count(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn interceptor_is_transparent_and_restorable() {
        let (monitor, sink) = monitor_with(NetworkConfig::default());
        let original = Arc::new(EchoIssuer {
            calls: AtomicUsize::new(0),
        });
        let (wrapped, restore) = monitor.intercept(original.clone());

        let outcome = wrapped
            .issue(&OutboundRequest::fetch("https://api.anthropic.com/v1/messages"))
            .await
            .unwrap();
        assert_eq!(outcome.status, Some(200));
        assert_eq!(outcome.body.as_deref(), Some("https://api.anthropic.com/v1/messages"));

        let err = wrapped
            .issue(&OutboundRequest::xhr_open("POST", "https://phind.com/fail"))
            .await;
        assert!(err.is_err());
        settle().await;
        assert_eq!(sink.count(), 2);

        let restored = restore.restore();
        restored
            .issue(&OutboundRequest::fetch("https://perplexity.ai"))
            .await
            .unwrap();
        wrapped
            .issue(&OutboundRequest::fetch("https://you.com"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(sink.count(), 2);
        assert_eq!(original.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hook_receives_domain_after_emit() {
        let sink = RecordingSink::new();
        let (emitter, _) = emitter_with(sink.clone(), SystemClock::shared());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let monitor = NetworkMonitor::with_violation_hook(emitter, &NetworkConfig::default(), move |d| {
            seen_clone.lock().unwrap().push(d.to_string());
        });
        monitor.activate();
        monitor.check_url("https://codeium.com/api").unwrap().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["codeium.com".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_monitor_reports_nothing() {
        let (monitor, sink) = monitor_with(NetworkConfig::default());
        monitor.deactivate();
        monitor.deactivate();
        assert!(monitor.check_url("https://api.openai.com").is_none());
        assert_eq!(sink.count(), 0);
        assert!(monitor.detected_domains().is_empty());
    }
}
