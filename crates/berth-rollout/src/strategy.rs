//! Rollout timing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds applied to every rollout step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Seconds to wait for a new instance to become healthy.
    pub health_timeout_secs: u64,
    /// Seconds any single control-plane call may take.
    pub call_deadline_secs: u64,
    /// Milliseconds between health probes.
    pub poll_interval_ms: u64,
    /// Consecutive healthy probes required to pass the gate.
    pub healthy_threshold: u32,
    /// Consecutive unhealthy probes that fail the gate early.
    pub unhealthy_threshold: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            health_timeout_secs: 120,
            call_deadline_secs: 30,
            poll_interval_ms: 1000,
            healthy_threshold: 1,
            unhealthy_threshold: 3,
        }
    }
}

impl RolloutConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
