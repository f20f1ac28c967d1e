//! The outbound boundary every monitor funnels through.
//!
//! Transport is the host's business; the engine only needs an [`EventSink`]
//! that can deliver a payload and report whether the backend ended the session.

mod rate_limit;

pub use rate_limit::{RateLimiter, SeenSet};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::{
    clock::SharedClock,
    models::{ProctorEvent, ProctorEventType, SessionContext},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkResponse {
    pub terminated: bool,
    #[serde(default)]
    pub warning_count: Option<u32>,
}

/// Delivers one event to the backend. Must tolerate concurrent calls from
/// independent monitors.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_event(
        &self,
        session_id: &str,
        event_type: ProctorEventType,
        payload: &Value,
    ) -> Result<SinkResponse>;
}

/// A sink bound to one session. Clones share the sink and the terminator.
#[derive(Clone)]
pub struct EventEmitter {
    context: SessionContext,
    sink: Arc<dyn EventSink>,
    clock: SharedClock,
}

impl EventEmitter {
    pub fn new(context: SessionContext, sink: Arc<dyn EventSink>, clock: SharedClock) -> Self {
        Self {
            context,
            sink,
            clock,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Stamp and deliver `event`. Transport failures are logged and dropped;
    /// a `terminated` verdict is forwarded to the session terminator before
    /// the response is handed back.
    pub async fn emit(&self, event: ProctorEvent) -> Option<SinkResponse> {
        let payload = event.to_payload(self.clock.wall_clock());
        let session_id = self.context.session_id();

        match self.sink.log_event(session_id, event.event_type, &payload).await {
            Ok(response) => {
                if response.terminated && self.context.terminator().terminate() {
                    log_info!(
                        "session {} terminated by backend after {}",
                        session_id,
                        event.event_type
                    );
                }
                Some(response)
            }
            Err(err) => {
                log_error!(
                    "failed to log {} for session {}: {err:?}",
                    event.event_type,
                    session_id
                );
                None
            }
        }
    }

    /// Fire-and-forget variant for synchronous host callbacks.
    pub fn spawn_emit(&self, event: ProctorEvent) -> JoinHandle<Option<SinkResponse>> {
        let emitter = self.clone();
        tokio::spawn(async move { emitter.emit(event).await })
    }
}
