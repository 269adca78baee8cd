//! Per-run hook parameters

use serde::{Deserialize, Serialize};

/// Strength and sampling window of one adapter run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookParams {
    /// Multiplier on the injected attention output
    pub weight: f64,
    /// First sampling progress (0.0 - 1.0) at which the adapter is active
    pub start: f64,
    /// Last sampling progress at which the adapter is active
    pub end: f64,
}

impl Default for HookParams {
    fn default() -> Self {
        Self {
            weight: 1.0,
            start: 0.0,
            end: 1.0,
        }
    }
}

impl HookParams {
    /// Full-window parameters with the given weight
    pub fn with_weight(weight: f64) -> Self {
        Self {
            weight,
            ..Default::default()
        }
    }

    /// Restrict to `[start, end]`
    pub fn window(mut self, start: f64, end: f64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Whether `progress` falls inside the inclusive window
    pub fn is_active(&self, progress: f64) -> bool {
        progress >= self.start && progress <= self.end
    }
}
