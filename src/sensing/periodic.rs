use std::future::Future;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(10);

/// A cancellable polling loop: the engine's replacement for `setInterval`.
///
/// The first tick fires one `period` after `start`, like a browser interval.
/// `stop` is synchronous and idempotent; once it returns no further tick body
/// starts, and a tick suspended mid-way is dropped at its next await point.
pub struct PeriodicTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    tick_timeout: Duration,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: None,
            cancel_token: None,
            tick_timeout: DEFAULT_TICK_TIMEOUT,
        }
    }

    pub fn with_tick_timeout(mut self, tick_timeout: Duration) -> Self {
        self.tick_timeout = tick_timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn start<F, Fut>(&mut self, period: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("{} already running", self.name);
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let name = self.name;
        let tick_timeout = self.tick_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if time::timeout(tick_timeout, tick()).await.is_err() {
                            log_warn!("{} tick timed out (> {:?})", name, tick_timeout);
                        }
                    }
                    _ = token_clone.cancelled() => {
                        log_info!("{} shutting down", name);
                        break;
                    }
                }
            }
        });

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
