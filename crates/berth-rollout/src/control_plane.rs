//! The control-plane seam.
//!
//! Group-level operations (create, update, scale, remove a service) are
//! composed by the controller from these four instance-level calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use berth_compose::{ServiceId, ServiceSpec};
use berth_core::EnvironmentName;

use crate::error::ControlPlaneResult;

/// Health of a single instance as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    /// Running, health check has not passed yet.
    Starting,
    Healthy,
    Unhealthy,
    /// Exited or no longer known to the control plane.
    Gone,
}

impl InstanceHealth {
    /// Will not recover on its own and has to be replaced.
    pub fn is_broken(self) -> bool {
        matches!(self, InstanceHealth::Unhealthy | InstanceHealth::Gone)
    }
}

/// One live instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedInstance {
    pub id: String,
    pub service: ServiceId,
    pub image: String,
    /// Revision of the spec the instance was created from.
    pub revision: String,
    pub health: InstanceHealth,
    /// Host address and port traffic can reach the instance on, when it
    /// publishes one.
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// Orchestration API that runs service instances.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Every live instance belonging to `env`.
    async fn observe(&self, env: EnvironmentName) -> ControlPlaneResult<Vec<ObservedInstance>>;

    /// Start one new instance of `spec`, returning its id.
    async fn create_instance(&self, spec: &ServiceSpec) -> ControlPlaneResult<String>;

    async fn instance_health(&self, id: &str) -> ControlPlaneResult<InstanceHealth>;

    /// Stop and delete an instance. Removing an unknown instance succeeds.
    async fn remove_instance(&self, id: &str) -> ControlPlaneResult<()>;
}
