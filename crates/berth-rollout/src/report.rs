//! Rollout reports — per-service state and the overall outcome.

use serde::{Deserialize, Serialize};

use berth_compose::ServiceId;
use berth_core::EnvironmentName;

use crate::error::ServiceFailure;
use crate::plan::StepAction;

/// Lifecycle of one service inside a rollout:
/// `Pending → Converging → {Healthy | Failed}`, or `Removed` for services
/// that are no longer desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Converging,
    Healthy,
    Failed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub service: ServiceId,
    pub action: StepAction,
    pub state: ServiceState,
    pub failure: Option<ServiceFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutOutcome {
    Running,
    Success,
    Partial,
}

/// Report of one rollout (or rollback) of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutResult {
    pub environment: EnvironmentName,
    pub outcome: RolloutOutcome,
    /// Unix timestamps (seconds).
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub services: Vec<ServiceReport>,
}

impl RolloutResult {
    pub(crate) fn start(environment: EnvironmentName, services: Vec<ServiceReport>) -> Self {
        Self {
            environment,
            outcome: RolloutOutcome::Running,
            started_at: epoch_secs(),
            finished_at: None,
            services,
        }
    }

    pub(crate) fn set_state(
        &mut self,
        service: ServiceId,
        state: ServiceState,
        failure: Option<ServiceFailure>,
    ) {
        if let Some(report) = self.services.iter_mut().find(|r| r.service == service) {
            report.state = state;
            report.failure = failure;
        }
    }

    /// Close the report: SUCCESS iff every service is healthy or removed.
    pub(crate) fn finish(&mut self) {
        let converged = self
            .services
            .iter()
            .all(|r| matches!(r.state, ServiceState::Healthy | ServiceState::Removed));
        self.outcome = if converged {
            RolloutOutcome::Success
        } else {
            RolloutOutcome::Partial
        };
        self.finished_at = Some(epoch_secs());
    }

    pub fn state_of(&self, service: ServiceId) -> Option<ServiceState> {
        self.services
            .iter()
            .find(|r| r.service == service)
            .map(|r| r.state)
    }

    pub fn failed(&self) -> Vec<ServiceId> {
        self.with_state(ServiceState::Failed)
    }

    pub fn pending(&self) -> Vec<ServiceId> {
        self.with_state(ServiceState::Pending)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RolloutOutcome::Success
    }

    fn with_state(&self, state: ServiceState) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.service)
            .collect()
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
