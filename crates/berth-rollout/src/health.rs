//! Health gate for newly created instances.
//!
//! A gate polls the control plane until the instance passes
//! `healthy_threshold` consecutive probes, fails `unhealthy_threshold`
//! consecutive probes, disappears, or runs out of time.

use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::control_plane::{ControlPlane, InstanceHealth};
use crate::error::ServiceFailure;
use crate::strategy::RolloutConfig;

/// Verdict of a tracker after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Waiting,
    Passed,
    Failed,
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(config: &RolloutConfig) -> Self {
        Self::with_thresholds(config.unhealthy_threshold, config.healthy_threshold)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the gate verdict.
    pub fn record(&mut self, health: InstanceHealth) -> GateStatus {
        match health {
            InstanceHealth::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.healthy_threshold {
                    return GateStatus::Passed;
                }
            }
            InstanceHealth::Starting => {
                // Still in its start period; neither streak advances.
                self.consecutive_successes = 0;
            }
            InstanceHealth::Unhealthy => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unhealthy_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance marked unhealthy"
                    );
                    return GateStatus::Failed;
                }
            }
            InstanceHealth::Gone => return GateStatus::Failed,
        }
        GateStatus::Waiting
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Wait for `instance` to pass its health gate.
///
/// Returns `Cancelled` as soon as `cancel` flips to `true`.
pub async fn wait_healthy(
    control_plane: &dyn ControlPlane,
    instance: &str,
    config: &RolloutConfig,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), ServiceFailure> {
    let deadline = Instant::now() + config.health_timeout();
    let mut tracker = HealthTracker::new(config);

    loop {
        if *cancel.borrow() {
            return Err(ServiceFailure::Cancelled);
        }

        let probe = timeout(config.call_deadline(), control_plane.instance_health(instance)).await;
        let health = match probe {
            Ok(Ok(health)) => health,
            Ok(Err(e)) => return Err(ServiceFailure::control_plane("health probe", e)),
            Err(_) => {
                return Err(ServiceFailure::control_plane(
                    "health probe",
                    format!("no answer within {}s", config.call_deadline_secs),
                ));
            }
        };
        debug!(instance, ?health, "health probe");

        match tracker.record(health) {
            GateStatus::Passed => return Ok(()),
            GateStatus::Failed => {
                return Err(ServiceFailure::Unhealthy {
                    instance: instance.to_string(),
                    probes: tracker.consecutive_failures().max(1),
                });
            }
            GateStatus::Waiting => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ServiceFailure::HealthCheckTimeout {
                instance: instance.to_string(),
                timeout_secs: config.health_timeout_secs,
            });
        }
        let pause = config.poll_interval().min(deadline - now);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            Ok(()) = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(ServiceFailure::Cancelled);
                }
            }
        }
    }
}
