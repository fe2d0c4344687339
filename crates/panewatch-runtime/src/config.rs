//! Daemon tunables, loadable from an optional TOML file.
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! overrides:
//!
//! ```toml
//! [capture]
//! idle_interval_ms = 5000
//!
//! [hooks]
//! subtask_tools = ["Task", "Agent", "Dispatch"]
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use panewatch_core::HookRules;
use panewatch_source_hooks::DedupConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub topology: TopologyConfig,
    pub capture: CaptureConfig,
    pub reconcile: ReconcileConfig,
    pub hooks: HookRules,
    pub dedup: DedupConfig,
    pub backpressure: BackpressureConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Poll interval while no control-mode client is attached.
    pub fast_interval_ms: u64,
    /// Poll interval while control mode reports structural changes.
    pub slow_interval_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 1000,
            slow_interval_ms: 5000,
        }
    }
}

impl TopologyConfig {
    pub fn interval(&self, control_mode_active: bool) -> Duration {
        if control_mode_active {
            ms(self.slow_interval_ms)
        } else {
            ms(self.fast_interval_ms)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub active_interval_ms: u64,
    /// How long after a change a pane counts as active.
    pub active_window_ms: u64,
    pub normal_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub backoff_interval_ms: u64,
    /// Unchanged captures in a row before backing off.
    pub backoff_after: u32,
    pub lines: u32,
    pub max_snapshot_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 250,
            active_window_ms: 2000,
            normal_interval_ms: 1000,
            idle_interval_ms: 3000,
            backoff_interval_ms: 5000,
            backoff_after: 10,
            lines: 200,
            max_snapshot_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub recheck_interval_ms: u64,
    /// Stop-guard recovery timeout.
    pub stop_guard_ms: u64,
    /// Content is not allowed to move a session this soon after a hook.
    pub hook_grace_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            recheck_interval_ms: 2000,
            stop_guard_ms: 5000,
            hook_grace_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub high_water_bytes: usize,
    pub low_water_bytes: usize,
    pub resume_check_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: 64 * 1024,
            low_water_bytes: 16 * 1024,
            resume_check_ms: 100,
        }
    }
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}
