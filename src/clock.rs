use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

/// Time source for every heuristic window in the engine.
///
/// `now_ms` is monotonic milliseconds since the clock was created and is what
/// rate limits, baselines and durations are computed from. `wall_clock` is only
/// used to stamp outgoing events.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;

    fn wall_clock(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock. Anchored on `tokio::time::Instant`, so a paused tokio
/// runtime (`start_paused`, `time::advance`) moves it too.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic state-machine tests and replay.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
            epoch: Utc::now(),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.epoch + ChronoDuration::milliseconds(self.now_ms() as i64)
    }
}
