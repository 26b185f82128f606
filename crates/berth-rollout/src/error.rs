//! Rollout error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use berth_compose::GraphError;
use berth_core::EnvironmentName;
use berth_state::StateError;

/// Result type alias for control-plane calls.
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

/// Failures reported by a control plane implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    #[error("control plane unreachable: {0}")]
    Unreachable(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("control plane rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },
}

/// A traffic publisher could not make the new routing live.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TrafficError(pub String);

/// Systemic rollout failures. All of them are returned before any
/// instance was touched.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("a rollout of {0} is already in progress")]
    InProgress(EnvironmentName),

    #[error("precondition failed for {environment}: {reason}")]
    Precondition {
        environment: EnvironmentName,
        reason: String,
    },

    #[error("invalid dependency graph: {0}")]
    InvalidGraph(#[from] GraphError),

    #[error("no previous spec recorded for {0}")]
    NoHistory(String),

    #[error("state store: {0}")]
    State(#[from] StateError),
}

/// Why one service did not converge. Scoped to that service; the rest of
/// the rollout continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceFailure {
    #[error("instance {instance} not healthy within {timeout_secs}s")]
    HealthCheckTimeout { instance: String, timeout_secs: u64 },

    #[error("instance {instance} reported unhealthy {probes} times in a row")]
    Unhealthy { instance: String, probes: u32 },

    #[error("control plane {operation} failed: {reason}")]
    ControlPlane { operation: String, reason: String },

    #[error("traffic was not moved off the instances being replaced: {reason}")]
    Traffic { reason: String },

    #[error("cancelled")]
    Cancelled,
}

impl ServiceFailure {
    pub(crate) fn control_plane(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::ControlPlane {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }
}
