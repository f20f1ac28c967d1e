use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipboardConfig {
    /// Pastes longer than this are `high` severity.
    pub paste_threshold: usize,
    /// Pastes longer than this are `critical` regardless of history.
    pub critical_length: usize,
    /// Cumulative paste count above which small pastes become `medium`.
    pub frequent_paste_count: u32,
    /// Two pastes closer than this belong to the same rapid run.
    pub rapid_window_ms: u64,
    /// Rapid runs longer than this escalate `low` to `medium`.
    pub rapid_run_length: u32,
    /// Emission gate: pastes at or below this length are noise...
    pub min_report_length: usize,
    /// ...unless the session has pasted more than this many times.
    pub min_report_count: u32,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            paste_threshold: 100,
            critical_length: 500,
            frequent_paste_count: 10,
            rapid_window_ms: 2_000,
            rapid_run_length: 3,
            min_report_length: 50,
            min_report_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystrokeConfig {
    pub learning_window_ms: u64,
    pub min_baseline_samples: usize,
    pub ring_capacity: usize,
    pub check_every_keys: u64,
    pub report_interval_ms: u64,
    /// Intervals at or above this are idle pauses, not cadence.
    pub idle_outlier_ms: u64,
    pub min_metric_samples: usize,
    pub burst_interval_ms: u64,
    pub pause_interval_ms: u64,
    /// Reported anomalies beyond this count are `high` instead of `medium`.
    pub escalate_after_anomalies: u32,
}

impl Default for KeystrokeConfig {
    fn default() -> Self {
        Self {
            learning_window_ms: 30_000,
            min_baseline_samples: 20,
            ring_capacity: 100,
            check_every_keys: 10,
            report_interval_ms: 30_000,
            idle_outlier_ms: 5_000,
            min_metric_samples: 5,
            burst_interval_ms: 50,
            pause_interval_ms: 2_000,
            escalate_after_anomalies: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub runtime_poll_ms: u64,
    pub z_index_threshold: i64,
    pub panel_max_width: u32,
    pub panel_min_height: u32,
    /// Element id of the engine's own overlay, never flagged.
    pub own_overlay_id: String,
    pub id_signatures: Vec<String>,
    pub class_signatures: Vec<String>,
    /// Same detection on the same node is reported once per window.
    pub report_interval_ms: u64,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            runtime_poll_ms: 5_000,
            z_index_threshold: 9_999,
            panel_max_width: 400,
            panel_min_height: 300,
            own_overlay_id: "security-overlay-root".into(),
            id_signatures: vec!["sidebar".into(), "gpt".into(), "copilot".into()],
            class_signatures: vec!["sidebar-content".into()],
            report_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Appended to the built-in AI-assistance denylist.
    pub extra_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenLockConfig {
    pub poll_ms: u64,
    /// Relative width/height drift tolerated before a violation.
    pub resolution_tolerance: f64,
    /// Same violation reason is reported once per window.
    pub report_interval_ms: u64,
}

impl Default for ScreenLockConfig {
    fn default() -> Self {
        Self {
            poll_ms: 2_000,
            resolution_tolerance: 0.05,
            report_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub viewport_poll_ms: u64,
    pub chrome_delta_px: u32,
    pub min_width_ratio: f64,
    pub clipboard_placeholder: String,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            viewport_poll_ms: 1_000,
            chrome_delta_px: 160,
            min_width_ratio: 0.90,
            clipboard_placeholder: "Protected Content".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub poll_ms: u64,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self { poll_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicyConfig {
    /// Violations other than devtools attempts are dropped this long after start.
    pub grace_period_ms: u64,
    pub face_missing_threshold_ms: u64,
    /// Blurs shorter than this are not reported on refocus.
    pub min_focus_loss_ms: u64,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            face_missing_threshold_ms: 5_000,
            min_focus_loss_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProctorConfig {
    pub clipboard: ClipboardConfig,
    pub keystroke: KeystrokeConfig,
    pub extension: ExtensionConfig,
    pub network: NetworkConfig,
    pub screen_lock: ScreenLockConfig,
    pub integrity: IntegrityConfig,
    pub face: FaceConfig,
    pub session: SessionPolicyConfig,
}

impl ProctorConfig {
    /// Rejects values that would stall a poller or divide by zero.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("extension.runtime_poll_ms", self.extension.runtime_poll_ms),
            ("screen_lock.poll_ms", self.screen_lock.poll_ms),
            ("integrity.viewport_poll_ms", self.integrity.viewport_poll_ms),
            ("face.poll_ms", self.face.poll_ms),
            ("keystroke.check_every_keys", self.keystroke.check_every_keys),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.keystroke.ring_capacity == 0 {
            bail!("keystroke.ring_capacity must be greater than zero");
        }
        Ok(())
    }
}

pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<ProctorConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            read_config(&path)?
        } else {
            ProctorConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn config(&self) -> Result<ProctorConfig> {
        let guard = self
            .data
            .read()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        Ok(guard.clone())
    }

    pub fn update(&self, config: ProctorConfig) -> Result<()> {
        config.validate()?;
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        *guard = config;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let data = read_config(&self.path)?;
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &ProctorConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }
}

fn read_config(path: &PathBuf) -> Result<ProctorConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: ProctorConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid proctor config in {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid proctor config in {}", path.display()))?;
    Ok(config)
}
