//! In-memory control plane.
//!
//! Used by tests and by dry runs: every mutation is appended to an event
//! log together with the number of healthy instances the service has left
//! afterwards, so callers can check availability across a rollout.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use berth_compose::{ServiceId, ServiceSpec};
use berth_core::EnvironmentName;

use crate::control_plane::{ControlPlane, InstanceHealth, ObservedInstance};
use crate::error::{ControlPlaneError, ControlPlaneResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Remove,
}

/// One mutation applied to the in-memory control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlPlaneEvent {
    pub kind: EventKind,
    pub service: ServiceId,
    pub instance: String,
    pub image: String,
    /// Healthy instances of `service` right after the mutation.
    pub healthy_after: usize,
}

#[derive(Debug, Clone)]
struct MemInstance {
    observed: ObservedInstance,
    probes: u32,
}

/// Control plane that keeps instances in a map.
///
/// New instances answer `Starting` for `startup_probes` probes and then
/// `Healthy`, unless their image was marked broken.
pub struct MemoryControlPlane {
    instances: Mutex<BTreeMap<String, MemInstance>>,
    events: Mutex<Vec<ControlPlaneEvent>>,
    broken_images: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    startup_probes: u32,
    next_id: AtomicU32,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::with_startup_probes(1)
    }

    pub fn with_startup_probes(startup_probes: u32) -> Self {
        Self {
            instances: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
            broken_images: Mutex::new(HashSet::new()),
            unreachable: AtomicBool::new(false),
            startup_probes,
            next_id: AtomicU32::new(1),
        }
    }

    /// Pre-populate with already running instances. Seeding is not logged.
    pub fn seed(&self, instances: impl IntoIterator<Item = ObservedInstance>) {
        let mut map = self.instances.lock().expect("instances lock");
        for observed in instances {
            map.insert(
                observed.id.clone(),
                MemInstance {
                    observed,
                    probes: 0,
                },
            );
        }
    }

    /// Instances of `image` never become healthy.
    pub fn break_image(&self, image: &str) {
        self.broken_images
            .lock()
            .expect("broken images lock")
            .insert(image.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ControlPlaneEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// Current instances of one service.
    pub fn instances_of(&self, service: ServiceId) -> Vec<ObservedInstance> {
        self.instances
            .lock()
            .expect("instances lock")
            .values()
            .filter(|i| i.observed.service == service)
            .map(|i| i.observed.clone())
            .collect()
    }

    fn check_reachable(&self) -> ControlPlaneResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Unreachable(
                "in-memory control plane set unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn log(
        &self,
        map: &BTreeMap<String, MemInstance>,
        kind: EventKind,
        observed: &ObservedInstance,
    ) {
        let healthy_after = map
            .values()
            .filter(|i| {
                i.observed.service == observed.service
                    && i.observed.health == InstanceHealth::Healthy
            })
            .count();
        self.events.lock().expect("events lock").push(ControlPlaneEvent {
            kind,
            service: observed.service,
            instance: observed.id.clone(),
            image: observed.image.clone(),
            healthy_after,
        });
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn observe(&self, env: EnvironmentName) -> ControlPlaneResult<Vec<ObservedInstance>> {
        self.check_reachable()?;
        let map = self.instances.lock().expect("instances lock");
        Ok(map
            .values()
            .filter(|i| i.observed.service.environment == env)
            .map(|i| i.observed.clone())
            .collect())
    }

    async fn create_instance(&self, spec: &ServiceSpec) -> ControlPlaneResult<String> {
        self.check_reachable()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}-{n}", spec.id.environment, spec.id.kind);
        let observed = ObservedInstance {
            id: id.clone(),
            service: spec.id,
            image: spec.image.clone(),
            revision: spec.revision(),
            health: InstanceHealth::Starting,
            address: spec.container_port.map(|_| "127.0.0.1".to_string()),
            port: spec.container_port.map(|_| 32000 + n as u16),
        };

        let mut map = self.instances.lock().expect("instances lock");
        map.insert(
            id.clone(),
            MemInstance {
                observed: observed.clone(),
                probes: 0,
            },
        );
        self.log(&map, EventKind::Create, &observed);
        debug!(instance = %id, service = %spec.id, "memory instance created");
        Ok(id)
    }

    async fn instance_health(&self, id: &str) -> ControlPlaneResult<InstanceHealth> {
        self.check_reachable()?;
        let broken = self
            .broken_images
            .lock()
            .expect("broken images lock")
            .clone();
        let mut map = self.instances.lock().expect("instances lock");
        let Some(instance) = map.get_mut(id) else {
            return Ok(InstanceHealth::Gone);
        };
        instance.probes += 1;
        if !broken.contains(&instance.observed.image) && instance.probes > self.startup_probes {
            instance.observed.health = InstanceHealth::Healthy;
        }
        Ok(instance.observed.health)
    }

    async fn remove_instance(&self, id: &str) -> ControlPlaneResult<()> {
        self.check_reachable()?;
        let mut map = self.instances.lock().expect("instances lock");
        if let Some(removed) = map.remove(id) {
            self.log(&map, EventKind::Remove, &removed.observed);
            debug!(instance = %id, "memory instance removed");
        }
        Ok(())
    }
}
