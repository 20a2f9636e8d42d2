//! Runtime configuration for the streaming system.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Screen-space error (pixels) a node may show before it is split.
pub const DEFAULT_ERROR_THRESHOLD: f32 = 2.5;

/// Lower clamp applied to per-dataset thresholds.
pub const MIN_ERROR_THRESHOLD: f32 = 0.5;

/// Upper clamp applied to per-dataset thresholds.
pub const MAX_ERROR_THRESHOLD: f32 = 10.0;

/// Whether queued (not yet started) load jobs accept late priority changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Priorities are fixed at push time
    Never,
    /// Only raising a priority is honoured
    IncrementOnly,
    /// Only lowering a priority is honoured
    DecrementOnly,
    /// Any change is honoured
    #[default]
    Always,
}

/// Streaming configuration.
///
/// Budgets are expressed in nodes except for the host budget, which is
/// given in megabytes and converted to a slot count once the node byte
/// size of the first registered dataset is known.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum nodes resident in the GPU buffer of one context.
    pub render_budget_nodes: u32,
    /// Maximum nodes uploaded to the GPU per update cycle.
    pub upload_budget_nodes: u32,
    /// Number of disk loader threads.
    pub loader_threads: usize,
    /// Host memory reserved for cached nodes (MB).
    pub host_budget_mb: usize,
    /// Default screen-space error threshold for datasets without one.
    pub error_threshold: f32,
    /// Priority revision policy of the load queue.
    pub queue_update_mode: UpdateMode,
    /// Failed reads tolerated per node before it is given up on.
    pub max_load_retries: u32,
    /// Refreshes between flushes of not-yet-started loads. 0 = never.
    pub queue_maintenance_interval: u32,
    /// Collapse sibling groups outside the frustum unconditionally.
    pub collapse_outside_frustum: bool,
    /// Nodes prefetched per cycle below strongly refined nodes. 0 = off.
    pub prefetch_budget: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            render_budget_nodes: 16 * 1024,
            upload_budget_nodes: 256,
            loader_threads: 4,
            host_budget_mb: 2048,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            queue_update_mode: UpdateMode::Always,
            max_load_retries: 3,
            queue_maintenance_interval: 0,
            collapse_outside_frustum: true,
            prefetch_budget: 0,
        }
    }
}

impl StreamingConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: StreamingConfig = serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.render_budget_nodes == 0 {
            return Err(Error::Config("render budget must be at least one node".into()));
        }
        if self.upload_budget_nodes == 0 {
            return Err(Error::Config("upload budget must be at least one node".into()));
        }
        if self.loader_threads == 0 {
            return Err(Error::Config("at least one loader thread is required".into()));
        }
        if self.host_budget_mb == 0 {
            return Err(Error::Config("host budget must be non-zero".into()));
        }
        if !self.error_threshold.is_finite() || self.error_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "error threshold must be positive, got {}",
                self.error_threshold
            )));
        }
        Ok(())
    }

    /// Host budget in bytes.
    pub fn host_budget_bytes(&self) -> usize {
        self.host_budget_mb * 1024 * 1024
    }
}

/// Clamp a threshold into the supported range.
pub fn clamp_threshold(threshold: f32) -> f32 {
    threshold.clamp(MIN_ERROR_THRESHOLD, MAX_ERROR_THRESHOLD)
}
