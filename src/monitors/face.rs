use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use crate::{clock::SharedClock, config::FaceConfig, sensing::PeriodicTask};

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// The camera element the detector reads frames from.
pub trait VideoFeed: Send + Sync {
    fn is_ready(&self) -> bool;

    fn dimensions(&self) -> (u32, u32);
}

/// External inference capability. Loading may take seconds and may fail.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn load_model(&self) -> Result<()>;

    async fn count_faces(&self, feed: &dyn VideoFeed) -> Result<usize>;
}

/// Raw signal surfaced to the host, which owns severity policy.
pub trait FaceSignalHandler: Send + Sync {
    fn on_face_detected(&self, count: usize);

    fn on_face_missing(&self, missing_for: Duration);

    fn on_multiple_faces(&self, count: usize);
}

#[derive(Debug, Default)]
struct FaceState {
    active: bool,
    supported: Option<bool>,
    face_count: usize,
    missing_since_ms: Option<u64>,
}

enum FaceSignal {
    None,
    Missing(Duration),
    Detected(usize),
}

struct FaceInner {
    detector: Arc<dyn FaceDetector>,
    feed: Arc<dyn VideoFeed>,
    handler: Arc<dyn FaceSignalHandler>,
    clock: SharedClock,
    state: Mutex<FaceState>,
}

impl FaceInner {
    async fn tick(&self) {
        if !lock(&self.state).active {
            return;
        }
        if !self.feed.is_ready() {
            return;
        }
        let (width, height) = self.feed.dimensions();
        if width == 0 || height == 0 {
            return;
        }

        let count = match self.detector.count_faces(self.feed.as_ref()).await {
            Ok(count) => count,
            Err(err) => {
                log_warn!("face detection failed: {err:?}");
                return;
            }
        };

        let signal = {
            let mut state = lock(&self.state);
            if !state.active {
                return;
            }
            state.face_count = count;
            if count == 0 {
                let now = self.clock.now_ms();
                match state.missing_since_ms {
                    None => {
                        state.missing_since_ms = Some(now);
                        FaceSignal::None
                    }
                    Some(since) => {
                        FaceSignal::Missing(Duration::from_millis(now.saturating_sub(since)))
                    }
                }
            } else {
                state.missing_since_ms = None;
                FaceSignal::Detected(count)
            }
        };

        match signal {
            FaceSignal::None => {}
            FaceSignal::Missing(missing_for) => self.handler.on_face_missing(missing_for),
            FaceSignal::Detected(count) => {
                self.handler.on_face_detected(count);
                if count > 1 {
                    self.handler.on_multiple_faces(count);
                }
            }
        }
    }
}

/// Counts faces on the camera feed once per poll period after the detector
/// model has loaded.
pub struct FaceDetectionMonitor {
    inner: Arc<FaceInner>,
    config: FaceConfig,
    poller: Mutex<PeriodicTask>,
}

impl FaceDetectionMonitor {
    pub fn new(
        config: FaceConfig,
        detector: Arc<dyn FaceDetector>,
        feed: Arc<dyn VideoFeed>,
        handler: Arc<dyn FaceSignalHandler>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(FaceInner {
                detector,
                feed,
                handler,
                clock,
                state: Mutex::new(FaceState::default()),
            }),
            config,
            poller: Mutex::new(PeriodicTask::new("face-detection-poll")),
        }
    }

    /// Loads the model and starts polling. A model that fails to load leaves
    /// the monitor disabled for the session; that is not an error for the host.
    pub async fn activate(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.active {
                return Ok(());
            }
            state.active = true;
        }

        if lock(&self.inner.state).supported.is_none() {
            let loaded = self.inner.detector.load_model().await;
            let mut state = lock(&self.inner.state);
            match loaded {
                Ok(()) => {
                    log_info!("face detection model loaded");
                    state.supported = Some(true);
                }
                Err(err) => {
                    log_error!("face detection model failed to load: {err:?}");
                    state.supported = Some(false);
                }
            }
        }

        {
            let state = lock(&self.inner.state);
            // Deactivated while the model was loading.
            if !state.active || state.supported != Some(true) {
                return Ok(());
            }
        }

        let inner = self.inner.clone();
        let period = Duration::from_millis(self.config.poll_ms);
        let mut poller = lock(&self.poller);
        if poller.is_running() {
            return Ok(());
        }
        poller.start(period, move || {
            let inner = inner.clone();
            async move {
                inner.tick().await;
            }
        })
    }

    pub fn deactivate(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.active = false;
            state.missing_since_ms = None;
        }
        lock(&self.poller).stop();
    }

    pub fn face_count(&self) -> usize {
        lock(&self.inner.state).face_count
    }

    pub fn is_face_missing(&self) -> bool {
        lock(&self.inner.state).missing_since_ms.is_some()
    }

    /// `None` until the model load has been attempted.
    pub fn is_supported(&self) -> Option<bool> {
        lock(&self.inner.state).supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeFeed {
        ready: AtomicBool,
        width: u32,
    }

    impl FakeFeed {
        fn ready(width: u32) -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicBool::new(true),
                width,
            })
        }
    }

    impl VideoFeed for FakeFeed {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn dimensions(&self) -> (u32, u32) {
            (self.width, if self.width == 0 { 0 } else { 480 })
        }
    }

    struct FakeDetector {
        faces: AtomicUsize,
        calls: AtomicUsize,
        load_fails: bool,
    }

    impl FakeDetector {
        fn seeing(faces: usize) -> Arc<Self> {
            Arc::new(Self {
                faces: AtomicUsize::new(faces),
                calls: AtomicUsize::new(0),
                load_fails: false,
            })
        }
    }

    #[async_trait]
    impl FaceDetector for FakeDetector {
        async fn load_model(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if self.load_fails {
                anyhow::bail!("model weights unreachable");
            }
            Ok(())
        }

        async fn count_faces(&self, _feed: &dyn VideoFeed) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.faces.load(Ordering::SeqCst))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Signal {
        Detected(usize),
        Missing(Duration),
        Multiple(usize),
    }

    #[derive(Default)]
    struct RecordingHandler {
        signals: Mutex<Vec<Signal>>,
    }

    impl RecordingHandler {
        fn signals(&self) -> Vec<Signal> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl FaceSignalHandler for RecordingHandler {
        fn on_face_detected(&self, count: usize) {
            self.signals.lock().unwrap().push(Signal::Detected(count));
        }

        fn on_face_missing(&self, missing_for: Duration) {
            self.signals.lock().unwrap().push(Signal::Missing(missing_for));
        }

        fn on_multiple_faces(&self, count: usize) {
            self.signals.lock().unwrap().push(Signal::Multiple(count));
        }
    }

    fn monitor(
        detector: Arc<FakeDetector>,
        feed: Arc<FakeFeed>,
    ) -> (FaceDetectionMonitor, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let monitor = FaceDetectionMonitor::new(
            FaceConfig::default(),
            detector,
            feed,
            handler.clone(),
            SystemClock::shared(),
        );
        (monitor, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn missing_duration_grows_from_first_empty_frame() {
        let detector = FakeDetector::seeing(0);
        let (monitor, handler) = monitor(detector.clone(), FakeFeed::ready(640));
        monitor.activate().await.unwrap();
        assert_eq!(monitor.is_supported(), Some(true));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(monitor.is_face_missing());
        assert!(handler.signals().is_empty());

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(
            handler.signals(),
            vec![
                Signal::Missing(Duration::from_millis(1_000)),
                Signal::Missing(Duration::from_millis(2_000)),
            ]
        );

        detector.faces.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!monitor.is_face_missing());
        assert_eq!(monitor.face_count(), 2);
        assert_eq!(
            &handler.signals()[2..],
            &[Signal::Detected(2), Signal::Multiple(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn feed_not_ready_skips_detection() {
        let detector = FakeDetector::seeing(1);
        let feed = FakeFeed::ready(0);
        let (monitor, handler) = monitor(detector.clone(), feed);
        monitor.activate().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert!(handler.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_model_load_disables_monitor() {
        let detector = Arc::new(FakeDetector {
            faces: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            load_fails: true,
        });
        let (monitor, handler) = monitor(detector.clone(), FakeFeed::ready(640));
        monitor.activate().await.unwrap();
        assert_eq!(monitor.is_supported(), Some(false));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert!(handler.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_stops_polling() {
        let detector = FakeDetector::seeing(1);
        let (monitor, handler) = monitor(detector.clone(), FakeFeed::ready(640));
        monitor.activate().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(handler.signals(), vec![Signal::Detected(1)]);

        monitor.deactivate();
        monitor.deactivate();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.signals().len(), 1);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }
}
