use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    config::KeystrokeConfig,
    emitter::{EventEmitter, RateLimiter},
    models::{ProctorEvent, ProctorEventType, Severity},
};

use super::lock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Typing cadence summary. Used both for the live window and the frozen
/// baseline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokeMetrics {
    pub avg_interval_ms: f64,
    pub std_dev_ms: f64,
    pub wpm: f64,
    pub burst_count: u32,
    pub pause_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystrokePhase {
    Learning,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeystrokeAnomaly {
    SpeedIncreased,
    SpeedDecreased,
    AbnormalBurst,
    HighWpm(f64),
    RhythmChanged,
}

impl KeystrokeAnomaly {
    pub fn reason(&self) -> String {
        match self {
            KeystrokeAnomaly::SpeedIncreased => {
                "Typing speed suddenly increased (possible paste or different typist)".to_string()
            }
            KeystrokeAnomaly::SpeedDecreased => {
                "Typing speed suddenly decreased (possible hesitation or lookup)".to_string()
            }
            KeystrokeAnomaly::AbnormalBurst => {
                "Abnormal burst typing detected (possible automated input)".to_string()
            }
            KeystrokeAnomaly::HighWpm(wpm) => format!("Unusually high typing speed: {wpm} WPM"),
            KeystrokeAnomaly::RhythmChanged => "Typing rhythm pattern changed significantly".to_string(),
        }
    }
}

/// Compares live metrics against the frozen baseline. Rules are ordered and
/// the first match wins.
pub fn classify_anomaly(
    current: &KeystrokeMetrics,
    baseline: &KeystrokeMetrics,
) -> Option<KeystrokeAnomaly> {
    if current.avg_interval_ms > 0.0 && current.avg_interval_ms < baseline.avg_interval_ms * 0.5 {
        return Some(KeystrokeAnomaly::SpeedIncreased);
    }
    if current.avg_interval_ms > baseline.avg_interval_ms * 2.0 {
        return Some(KeystrokeAnomaly::SpeedDecreased);
    }
    if current.burst_count > baseline.burst_count.saturating_mul(3) && current.burst_count > 10 {
        return Some(KeystrokeAnomaly::AbnormalBurst);
    }
    if current.wpm > 120.0 && baseline.wpm < 80.0 {
        return Some(KeystrokeAnomaly::HighWpm(current.wpm));
    }
    if (current.std_dev_ms - baseline.std_dev_ms).abs() > baseline.std_dev_ms * 1.5 {
        return Some(KeystrokeAnomaly::RhythmChanged);
    }
    None
}

/// Printable single characters plus the editing keys that carry typing rhythm.
pub fn is_tracked_key(key: &str) -> bool {
    key.chars().count() == 1 || matches!(key, "Backspace" | "Enter" | "Tab" | "Space")
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeystrokeOutcome {
    BaselineEstablished(KeystrokeMetrics),
    Anomaly {
        anomaly: KeystrokeAnomaly,
        metrics: KeystrokeMetrics,
        baseline: KeystrokeMetrics,
        severity: Severity,
        anomaly_count: u32,
    },
}

/// Learning/Monitoring state machine over a bounded ring of inter-key
/// intervals. The baseline is set once and never changes afterwards.
#[derive(Debug, Clone)]
pub struct KeystrokeAnalyzer {
    config: KeystrokeConfig,
    started_at_ms: u64,
    intervals: VecDeque<u64>,
    last_key_ms: Option<u64>,
    char_count: u64,
    baseline: Option<KeystrokeMetrics>,
    limiter: RateLimiter<()>,
    anomaly_count: u32,
}

impl KeystrokeAnalyzer {
    pub fn new(config: KeystrokeConfig, started_at_ms: u64) -> Self {
        let limiter = RateLimiter::new(config.report_interval_ms);
        let intervals = VecDeque::with_capacity(config.ring_capacity);
        Self {
            config,
            started_at_ms,
            intervals,
            last_key_ms: None,
            char_count: 0,
            baseline: None,
            limiter,
            anomaly_count: 0,
        }
    }

    pub fn phase(&self) -> KeystrokePhase {
        if self.baseline.is_some() {
            KeystrokePhase::Monitoring
        } else {
            KeystrokePhase::Learning
        }
    }

    pub fn baseline(&self) -> Option<KeystrokeMetrics> {
        self.baseline
    }

    pub fn anomaly_count(&self) -> u32 {
        self.anomaly_count
    }

    pub fn sample_count(&self) -> usize {
        self.intervals.len()
    }

    /// Metrics over the live ring. All zeros until enough non-idle samples exist.
    pub fn metrics(&self, now_ms: u64) -> KeystrokeMetrics {
        let min_samples = self.config.min_metric_samples;
        if self.intervals.len() < min_samples {
            return KeystrokeMetrics::default();
        }

        let filtered: Vec<f64> = self
            .intervals
            .iter()
            .filter(|interval| **interval < self.config.idle_outlier_ms)
            .map(|interval| *interval as f64)
            .collect();
        if filtered.len() < min_samples {
            return KeystrokeMetrics::default();
        }

        let n = filtered.len() as f64;
        let avg = filtered.iter().sum::<f64>() / n;
        let variance = filtered.iter().map(|i| (i - avg).powi(2)).sum::<f64>() / n;

        let elapsed_minutes = now_ms.saturating_sub(self.started_at_ms) as f64 / 60_000.0;
        let wpm = if elapsed_minutes > 0.0 {
            (self.char_count as f64 / 5.0) / elapsed_minutes
        } else {
            0.0
        };

        let burst_count = self
            .intervals
            .iter()
            .filter(|i| **i < self.config.burst_interval_ms)
            .count() as u32;
        let pause_count = self
            .intervals
            .iter()
            .filter(|i| **i > self.config.pause_interval_ms)
            .count() as u32;

        KeystrokeMetrics {
            avg_interval_ms: avg.round(),
            std_dev_ms: variance.sqrt().round(),
            wpm: wpm.round(),
            burst_count,
            pause_count,
        }
    }

    /// Feed one keydown. Returns the baseline on the transition to
    /// Monitoring, or a rate-limited anomaly on a checkpoint key.
    pub fn record_key(&mut self, key: &str, now_ms: u64) -> Option<KeystrokeOutcome> {
        if !is_tracked_key(key) {
            return None;
        }

        self.char_count += 1;
        if let Some(last) = self.last_key_ms {
            self.intervals.push_back(now_ms.saturating_sub(last));
            while self.intervals.len() > self.config.ring_capacity {
                self.intervals.pop_front();
            }
        }
        self.last_key_ms = Some(now_ms);

        let Some(baseline) = self.baseline else {
            let elapsed = now_ms.saturating_sub(self.started_at_ms);
            if elapsed < self.config.learning_window_ms
                || self.intervals.len() < self.config.min_baseline_samples
            {
                return None;
            }
            // Mostly idle pauses so far: keep learning until there is cadence
            // to freeze.
            let baseline = self.metrics(now_ms);
            if baseline.avg_interval_ms <= 0.0 {
                return None;
            }
            self.baseline = Some(baseline);
            return Some(KeystrokeOutcome::BaselineEstablished(baseline));
        };

        if self.char_count % self.config.check_every_keys.max(1) != 0
            || self.intervals.len() < self.config.min_baseline_samples
        {
            return None;
        }

        let metrics = self.metrics(now_ms);
        let anomaly = classify_anomaly(&metrics, &baseline)?;
        if !self.limiter.permit((), now_ms) {
            return None;
        }

        self.anomaly_count += 1;
        let severity = if self.anomaly_count > self.config.escalate_after_anomalies {
            Severity::High
        } else {
            Severity::Medium
        };
        Some(KeystrokeOutcome::Anomaly {
            anomaly,
            metrics,
            baseline,
            severity,
            anomaly_count: self.anomaly_count,
        })
    }
}

type AnomalyHook = Arc<dyn Fn(&str, &KeystrokeMetrics) + Send + Sync>;

struct KeystrokeState {
    active: bool,
    analyzer: Option<KeystrokeAnalyzer>,
}

pub struct KeystrokeDynamicsMonitor {
    emitter: EventEmitter,
    config: KeystrokeConfig,
    state: Mutex<KeystrokeState>,
    on_anomaly: Option<AnomalyHook>,
}

impl KeystrokeDynamicsMonitor {
    pub fn new(emitter: EventEmitter, config: KeystrokeConfig) -> Self {
        Self {
            emitter,
            config,
            state: Mutex::new(KeystrokeState {
                active: false,
                analyzer: None,
            }),
            on_anomaly: None,
        }
    }

    pub fn with_anomaly_hook(
        mut self,
        hook: impl Fn(&str, &KeystrokeMetrics) + Send + Sync + 'static,
    ) -> Self {
        self.on_anomaly = Some(Arc::new(hook));
        self
    }

    /// The learning window starts at the first activation of the session.
    pub fn activate(&self) {
        let now = self.emitter.clock().now_ms();
        let mut state = lock(&self.state);
        state.active = true;
        if state.analyzer.is_none() {
            state.analyzer = Some(KeystrokeAnalyzer::new(self.config.clone(), now));
        }
    }

    pub fn deactivate(&self) {
        lock(&self.state).active = false;
    }

    pub fn phase(&self) -> KeystrokePhase {
        lock(&self.state)
            .analyzer
            .as_ref()
            .map(KeystrokeAnalyzer::phase)
            .unwrap_or(KeystrokePhase::Learning)
    }

    pub fn baseline(&self) -> Option<KeystrokeMetrics> {
        lock(&self.state).analyzer.as_ref().and_then(|a| a.baseline())
    }

    pub fn anomaly_count(&self) -> u32 {
        lock(&self.state)
            .analyzer
            .as_ref()
            .map(KeystrokeAnalyzer::anomaly_count)
            .unwrap_or(0)
    }

    pub fn current_metrics(&self) -> KeystrokeMetrics {
        let now = self.emitter.clock().now_ms();
        lock(&self.state)
            .analyzer
            .as_ref()
            .map(|a| a.metrics(now))
            .unwrap_or_default()
    }

    /// `key` is the DOM `KeyboardEvent.key` value.
    pub async fn on_key_down(&self, key: &str) {
        if !self.emitter.context().is_active() {
            return;
        }
        let now = self.emitter.clock().now_ms();
        let outcome = {
            let mut state = lock(&self.state);
            if !state.active {
                return;
            }
            match state.analyzer.as_mut() {
                Some(analyzer) => analyzer.record_key(key, now),
                None => return,
            }
        };

        match outcome {
            None => {}
            Some(KeystrokeOutcome::BaselineEstablished(baseline)) => {
                log_info!("keystroke baseline established: {:?}", baseline);
                let event = ProctorEvent::new(
                    ProctorEventType::KeystrokeBaselineEstablished,
                    Severity::Low,
                    "Typing baseline established",
                )
                .with_field("baseline", baseline);
                self.emitter.emit(event).await;
            }
            Some(KeystrokeOutcome::Anomaly {
                anomaly,
                metrics,
                baseline,
                severity,
                anomaly_count,
            }) => {
                let reason = anomaly.reason();
                log_warn!("keystroke dynamics: {}", reason);
                let event = ProctorEvent::new(
                    ProctorEventType::KeystrokeAnomaly,
                    severity,
                    format!("Typing pattern anomaly: {reason}"),
                )
                .with_field("reason", &reason)
                .with_field("metrics", metrics)
                .with_field("baseline", baseline)
                .with_field("anomalyCount", anomaly_count);

                if self.emitter.emit(event).await.is_some() {
                    if let Some(hook) = &self.on_anomaly {
                        hook(&reason, &metrics);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        emitter::testing::{emitter_with, RecordingSink},
    };

    fn frozen(avg: f64, std_dev: f64, wpm: f64, bursts: u32) -> KeystrokeMetrics {
        KeystrokeMetrics {
            avg_interval_ms: avg,
            std_dev_ms: std_dev,
            wpm,
            burst_count: bursts,
            pause_count: 0,
        }
    }

    fn analyzer_with_baseline(baseline: KeystrokeMetrics) -> KeystrokeAnalyzer {
        let mut analyzer = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        analyzer.baseline = Some(baseline);
        analyzer
    }

    fn type_steadily(
        analyzer: &mut KeystrokeAnalyzer,
        from_ms: u64,
        interval_ms: u64,
        keys: u64,
    ) -> Vec<KeystrokeOutcome> {
        (0..keys)
            .filter_map(|i| analyzer.record_key("a", from_ms + i * interval_ms))
            .collect()
    }

    #[test]
    fn tracked_keys() {
        assert!(is_tracked_key("a"));
        assert!(is_tracked_key("{"));
        assert!(is_tracked_key("Backspace"));
        assert!(is_tracked_key("Space"));
        assert!(!is_tracked_key("Shift"));
        assert!(!is_tracked_key("ArrowLeft"));
    }

    #[test]
    fn rules_are_ordered() {
        let baseline = frozen(200.0, 50.0, 40.0, 2);
        assert_eq!(
            classify_anomaly(&frozen(80.0, 0.0, 300.0, 20), &baseline),
            Some(KeystrokeAnomaly::SpeedIncreased)
        );
        assert_eq!(
            classify_anomaly(&frozen(500.0, 0.0, 10.0, 0), &baseline),
            Some(KeystrokeAnomaly::SpeedDecreased)
        );
        assert_eq!(
            classify_anomaly(&frozen(180.0, 50.0, 40.0, 11), &baseline),
            Some(KeystrokeAnomaly::AbnormalBurst)
        );
        assert_eq!(
            classify_anomaly(&frozen(180.0, 50.0, 130.0, 2), &baseline),
            Some(KeystrokeAnomaly::HighWpm(130.0))
        );
        assert_eq!(
            classify_anomaly(&frozen(180.0, 130.0, 40.0, 2), &baseline),
            Some(KeystrokeAnomaly::RhythmChanged)
        );
        assert_eq!(classify_anomaly(&frozen(190.0, 60.0, 45.0, 3), &baseline), None);
    }

    #[test]
    fn zero_metrics_never_count_as_faster() {
        let baseline = frozen(200.0, 50.0, 40.0, 2);
        assert_ne!(
            classify_anomaly(&KeystrokeMetrics::default(), &baseline),
            Some(KeystrokeAnomaly::SpeedIncreased)
        );
    }

    #[test]
    fn idle_pauses_are_outliers() {
        let mut analyzer = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        let mut at = 0;
        for i in 0..12 {
            analyzer.record_key("a", at);
            at += if i == 6 { 9_000 } else { 100 };
        }
        let metrics = analyzer.metrics(at);
        assert_eq!(metrics.avg_interval_ms, 100.0);
        assert_eq!(metrics.std_dev_ms, 0.0);
        assert_eq!(metrics.pause_count, 1);
    }

    #[test]
    fn too_few_samples_give_zero_metrics() {
        let mut analyzer = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        type_steadily(&mut analyzer, 0, 100, 4);
        assert_eq!(analyzer.metrics(1_000), KeystrokeMetrics::default());
    }

    #[test]
    fn ring_is_bounded() {
        let mut analyzer = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        type_steadily(&mut analyzer, 0, 100, 250);
        assert_eq!(analyzer.sample_count(), 100);
    }

    #[test]
    fn baseline_needs_both_time_and_samples() {
        let mut slow = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        let outcomes = type_steadily(&mut slow, 0, 2_500, 15);
        assert!(outcomes.is_empty());
        assert_eq!(slow.phase(), KeystrokePhase::Learning);

        let mut fast = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        let outcomes = type_steadily(&mut fast, 0, 200, 150);
        assert!(outcomes.is_empty());
        assert_eq!(fast.phase(), KeystrokePhase::Learning);

        let outcome = fast.record_key("a", 30_000);
        let Some(KeystrokeOutcome::BaselineEstablished(baseline)) = outcome else {
            panic!("expected baseline, got {outcome:?}");
        };
        assert_eq!(baseline.avg_interval_ms, 200.0);
        assert_eq!(fast.phase(), KeystrokePhase::Monitoring);
    }

    #[test]
    fn idle_learning_window_does_not_freeze_zero_baseline() {
        let mut analyzer = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        let mut outcomes = type_steadily(&mut analyzer, 0, 6_000, 17);
        outcomes.extend(type_steadily(&mut analyzer, 96_200, 200, 4));
        assert!(outcomes.is_empty());
        assert_eq!(analyzer.phase(), KeystrokePhase::Learning);

        let outcomes = type_steadily(&mut analyzer, 97_000, 200, 600);
        let baselines: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                KeystrokeOutcome::BaselineEstablished(b) => Some(*b),
                _ => None,
            })
            .collect();
        assert_eq!(baselines.len(), 1);
        assert!(baselines[0].avg_interval_ms > 0.0);
        assert!(outcomes
            .iter()
            .all(|o| !matches!(o, KeystrokeOutcome::Anomaly { .. })));
    }

    #[test]
    fn zero_check_interval_checks_every_key() {
        let config = KeystrokeConfig {
            check_every_keys: 0,
            ..KeystrokeConfig::default()
        };
        let mut analyzer = KeystrokeAnalyzer::new(config, 0);
        analyzer.baseline = Some(frozen(200.0, 50.0, 40.0, 2));
        let outcomes = type_steadily(&mut analyzer, 0, 80, 30);
        assert_eq!(outcomes.len(), 1);
    }

    #[test]
    fn baseline_is_frozen() {
        let mut analyzer = KeystrokeAnalyzer::new(KeystrokeConfig::default(), 0);
        type_steadily(&mut analyzer, 0, 200, 152);
        let first = analyzer.baseline().unwrap();

        let outcomes = type_steadily(&mut analyzer, 31_000, 220, 400);
        assert!(outcomes
            .iter()
            .all(|o| !matches!(o, KeystrokeOutcome::BaselineEstablished(_))));
        assert_eq!(analyzer.baseline(), Some(first));
    }

    #[test]
    fn fast_stream_trips_speed_increase_once_per_window() {
        let mut analyzer = analyzer_with_baseline(frozen(200.0, 50.0, 40.0, 2));
        let outcomes = type_steadily(&mut analyzer, 0, 80, 30);
        assert_eq!(outcomes.len(), 1);
        let KeystrokeOutcome::Anomaly {
            anomaly, severity, ..
        } = &outcomes[0]
        else {
            panic!("expected anomaly");
        };
        assert_eq!(*anomaly, KeystrokeAnomaly::SpeedIncreased);
        assert_eq!(*severity, Severity::Medium);

        // Still anomalous at later checkpoints, but inside the 30s window.
        let later = type_steadily(&mut analyzer, 2_400, 80, 100);
        assert!(later.is_empty());
    }

    #[test]
    fn slow_stream_trips_speed_decrease_instead() {
        let mut analyzer = analyzer_with_baseline(frozen(200.0, 50.0, 40.0, 2));
        let outcomes = type_steadily(&mut analyzer, 0, 500, 30);
        assert!(matches!(
            outcomes.as_slice(),
            [KeystrokeOutcome::Anomaly {
                anomaly: KeystrokeAnomaly::SpeedDecreased,
                ..
            }]
        ));
    }

    #[test]
    fn severity_escalates_after_three_reports() {
        let mut analyzer = analyzer_with_baseline(frozen(200.0, 50.0, 40.0, 2));
        let mut severities = Vec::new();
        for window in 0..5u64 {
            let from = window * 40_000;
            for outcome in type_steadily(&mut analyzer, from, 80, 30) {
                if let KeystrokeOutcome::Anomaly { severity, .. } = outcome {
                    severities.push(severity);
                }
            }
        }
        assert_eq!(
            severities,
            vec![
                Severity::Medium,
                Severity::Medium,
                Severity::Medium,
                Severity::High,
                Severity::High
            ]
        );
        assert_eq!(analyzer.anomaly_count(), 5);
    }

    #[tokio::test]
    async fn monitor_emits_baseline_then_anomaly() {
        let sink = RecordingSink::new();
        let clock = ManualClock::new();
        let (emitter, _) = emitter_with(sink.clone(), Arc::new(clock.clone()));
        let monitor = KeystrokeDynamicsMonitor::new(emitter, KeystrokeConfig::default());
        monitor.activate();

        for _ in 0..=150 {
            monitor.on_key_down("x").await;
            clock.advance(200);
        }
        let baselines = sink.of_type(ProctorEventType::KeystrokeBaselineEstablished);
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].payload["severity"], "low");
        assert_eq!(baselines[0].payload["baseline"]["avgIntervalMs"], 200.0);

        for _ in 0..100 {
            monitor.on_key_down("x").await;
            clock.advance(60);
        }
        let anomalies = sink.of_type(ProctorEventType::KeystrokeAnomaly);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].payload["anomalyCount"], 1);
        assert_eq!(monitor.anomaly_count(), 1);
    }

    #[tokio::test]
    async fn deactivated_monitor_ignores_keys() {
        let sink = RecordingSink::new();
        let clock = ManualClock::new();
        let (emitter, _) = emitter_with(sink.clone(), Arc::new(clock.clone()));
        let monitor = KeystrokeDynamicsMonitor::new(emitter, KeystrokeConfig::default());
        monitor.activate();
        monitor.deactivate();
        monitor.deactivate();
        for _ in 0..300 {
            monitor.on_key_down("x").await;
            clock.advance(200);
        }
        assert_eq!(sink.count(), 0);
        assert_eq!(monitor.phase(), KeystrokePhase::Learning);
    }
}
