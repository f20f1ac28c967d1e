use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const TAB_ID_LEN: usize = 10;
const LOCAL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabAnnouncement {
    pub tab_id: String,
    /// Wall-clock milliseconds since the epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    TabOpened(TabAnnouncement),
    /// Reply to a foreign `TAB_OPENED` so the newcomer learns of us too.
    TabPresent(TabAnnouncement),
    TabClosed(TabAnnouncement),
}

impl TabMessage {
    pub fn announcement(&self) -> &TabAnnouncement {
        match self {
            TabMessage::TabOpened(a) | TabMessage::TabPresent(a) | TabMessage::TabClosed(a) => a,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("cross-tab broadcast is unavailable: {0}")]
    Unavailable(String),
    #[error("channel is closed")]
    Closed,
}

/// One tab's end of a named same-origin message bus. Like the browser
/// primitive, a channel never receives its own posts.
#[async_trait]
pub trait TabChannel: Send + Sync {
    fn post(&self, message: &TabMessage) -> Result<(), ChannelError>;

    /// Next message from another tab; `None` once the channel is closed.
    async fn recv(&self) -> Option<TabMessage>;

    fn close(&self);
}

pub trait BroadcastHub: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn TabChannel>, ChannelError>;
}

#[derive(Debug, Clone)]
struct Envelope {
    sender: u64,
    message: TabMessage,
}

/// In-process hub for hosts (and tests) that run several tabs in one runtime.
#[derive(Default)]
pub struct LocalBroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    next_id: AtomicU64,
}

impl LocalBroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BroadcastHub for LocalBroadcastHub {
    fn open(&self, name: &str) -> Result<Box<dyn TabChannel>, ChannelError> {
        let tx = lock(&self.channels)
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone();
        let rx = tx.subscribe();
        Ok(Box::new(LocalTabChannel {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }))
    }
}

struct LocalTabChannel {
    id: u64,
    tx: broadcast::Sender<Envelope>,
    rx: tokio::sync::Mutex<broadcast::Receiver<Envelope>>,
    closed: CancellationToken,
}

#[async_trait]
impl TabChannel for LocalTabChannel {
    fn post(&self, message: &TabMessage) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        // Fails only when nobody is listening, which is not an error for a bus.
        let _ = self.tx.send(Envelope {
            sender: self.id,
            message: message.clone(),
        });
        Ok(())
    }

    async fn recv(&self) -> Option<TabMessage> {
        let mut rx = self.rx.lock().await;
        loop {
            let received = tokio::select! {
                _ = self.closed.cancelled() => return None,
                received = rx.recv() => received,
            };
            match received {
                Ok(envelope) if envelope.sender == self.id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_warn!("tab channel lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Hub for runtimes with no cross-tab primitive.
pub struct UnsupportedBroadcastHub;

impl BroadcastHub for UnsupportedBroadcastHub {
    fn open(&self, _name: &str) -> Result<Box<dyn TabChannel>, ChannelError> {
        Err(ChannelError::Unavailable("no broadcast primitive".into()))
    }
}

pub fn generate_tab_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TAB_ID_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

type TabsHook = Arc<dyn Fn(bool) + Send + Sync>;

struct TabShared {
    tab_id: String,
    clock: SharedClock,
    is_active: AtomicBool,
    /// Foreign tabs already reported to the host.
    seen_tabs: Mutex<HashSet<String>>,
    on_multiple_tabs: TabsHook,
}

impl TabShared {
    fn announce(&self) -> TabAnnouncement {
        TabAnnouncement {
            tab_id: self.tab_id.clone(),
            timestamp: self.clock.wall_clock().timestamp_millis(),
        }
    }

    fn flag_foreign_tab(&self, tab_id: &str) {
        self.is_active.store(false, Ordering::SeqCst);
        if lock(&self.seen_tabs).insert(tab_id.to_string()) {
            log_warn!("multiple test tabs detected: {} shares this assignment", tab_id);
            (self.on_multiple_tabs)(false);
        }
    }

    fn handle(&self, channel: &dyn TabChannel, message: TabMessage) {
        if message.announcement().tab_id == self.tab_id {
            return;
        }
        match message {
            TabMessage::TabOpened(peer) => {
                self.flag_foreign_tab(&peer.tab_id);
                if let Err(err) = channel.post(&TabMessage::TabPresent(self.announce())) {
                    log_warn!("failed to answer tab {}: {err}", peer.tab_id);
                }
            }
            TabMessage::TabPresent(peer) => self.flag_foreign_tab(&peer.tab_id),
            TabMessage::TabClosed(peer) => {
                // Stay restricted; a recruiter has to review the overlap.
                log_info!("tab {} closed; this tab stays restricted", peer.tab_id);
            }
        }
    }
}

struct Connection {
    channel: Arc<dyn TabChannel>,
    listener: JoinHandle<()>,
}

/// Detects a second live tab on the same assignment over an ephemeral
/// cross-tab bus. Detection is symmetric: both tabs flip to inactive.
pub struct SingleTabEnforcer {
    hub: Arc<dyn BroadcastHub>,
    assignment_id: String,
    shared: Arc<TabShared>,
    connection: Mutex<Option<Connection>>,
}

impl SingleTabEnforcer {
    pub fn new(
        hub: Arc<dyn BroadcastHub>,
        assignment_id: impl Into<String>,
        clock: SharedClock,
        on_multiple_tabs: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            hub,
            assignment_id: assignment_id.into(),
            shared: Arc::new(TabShared {
                tab_id: generate_tab_id(),
                clock,
                is_active: AtomicBool::new(true),
                seen_tabs: Mutex::new(HashSet::new()),
                on_multiple_tabs: Arc::new(on_multiple_tabs),
            }),
            connection: Mutex::new(None),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.shared.tab_id
    }

    pub fn channel_name(&self) -> String {
        format!("assignment_{}", self.assignment_id)
    }

    /// False once another tab for the same assignment has been seen.
    pub fn is_active(&self) -> bool {
        self.shared.is_active.load(Ordering::SeqCst)
    }

    pub fn is_enforcing(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Opens the channel and announces this tab. When the runtime has no
    /// broadcast primitive the enforcer logs and stays disabled.
    pub fn activate(&self) {
        let mut connection = lock(&self.connection);
        if connection.is_some() {
            return;
        }

        let channel: Arc<dyn TabChannel> = match self.hub.open(&self.channel_name()) {
            Ok(channel) => Arc::from(channel),
            Err(err) => {
                log_warn!("single-tab enforcement disabled: {err}");
                return;
            }
        };

        if let Err(err) = channel.post(&TabMessage::TabOpened(self.shared.announce())) {
            log_warn!("single-tab enforcement disabled, announce failed: {err}");
            channel.close();
            return;
        }

        let shared = self.shared.clone();
        let listening = channel.clone();
        let listener = tokio::spawn(async move {
            while let Some(message) = listening.recv().await {
                shared.handle(listening.as_ref(), message);
            }
        });

        log_info!("tab {} watching {}", self.shared.tab_id, self.channel_name());
        *connection = Some(Connection { channel, listener });
    }

    /// Announces `TAB_CLOSED` and closes the channel. Idempotent.
    pub fn deactivate(&self) {
        let Some(Connection { channel, listener }) = lock(&self.connection).take() else {
            return;
        };
        if let Err(err) = channel.post(&TabMessage::TabClosed(self.shared.announce())) {
            log_warn!("failed to announce tab close: {err}");
        }
        channel.close();
        listener.abort();
    }
}

impl Drop for SingleTabEnforcer {
    fn drop(&mut self) {
        self.deactivate();
    }
}
