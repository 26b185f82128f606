//! Rollout planning — desired specs vs. observed instances.
//!
//! A plan is computed fresh for every invocation and never persisted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use berth_compose::{ServiceId, ServiceSpec};
use berth_core::EnvironmentName;

use crate::control_plane::{InstanceHealth, ObservedInstance};

/// What has to happen to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Nothing is running; start `replicas` instances.
    Create { replicas: u32 },
    /// Some instances run a different revision; replace them one by one.
    Update {
        revision: String,
        stale: u32,
        current: u32,
        replicas: u32,
    },
    /// Every instance is current but some are broken or still starting.
    /// Broken ones are replaced, starting ones have to pass the gate.
    Repair {
        unhealthy: u32,
        starting: u32,
        replicas: u32,
    },
    /// Every instance is current but the count differs.
    Scale { from: u32, to: u32 },
    /// Observed but no longer desired.
    Remove { instances: u32 },
    Noop,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Create { replicas } => write!(f, "create {replicas}"),
            StepAction::Update {
                revision,
                stale,
                replicas,
                ..
            } => write!(f, "update {stale} stale -> {revision} ({replicas} replicas)"),
            StepAction::Repair {
                unhealthy,
                starting,
                replicas,
            } => write!(
                f,
                "repair {unhealthy} unhealthy, {starting} starting ({replicas} replicas)"
            ),
            StepAction::Scale { from, to } => write!(f, "scale {from} -> {to}"),
            StepAction::Remove { instances } => write!(f, "remove {instances}"),
            StepAction::Noop => f.write_str("unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub service: ServiceId,
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub environment: EnvironmentName,
    pub steps: Vec<PlanStep>,
}

impl RolloutPlan {
    pub fn action(&self, service: &ServiceId) -> Option<&StepAction> {
        self.steps
            .iter()
            .find(|s| &s.service == service)
            .map(|s| &s.action)
    }

    pub fn removals(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.action, StepAction::Remove { .. }))
    }

    /// Whether applying the plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| s.action == StepAction::Noop)
    }
}

/// Group observed instances by service, ordered by instance id.
pub fn group_by_service(observed: &[ObservedInstance]) -> BTreeMap<ServiceId, Vec<ObservedInstance>> {
    let mut groups: BTreeMap<ServiceId, Vec<ObservedInstance>> = BTreeMap::new();
    for instance in observed {
        groups.entry(instance.service).or_default().push(instance.clone());
    }
    for instances in groups.values_mut() {
        instances.sort_by(|a, b| a.id.cmp(&b.id));
    }
    groups
}

/// Diff desired specs against the observed instances of one environment.
pub fn diff(
    environment: EnvironmentName,
    desired: &[ServiceSpec],
    observed: &[ObservedInstance],
) -> RolloutPlan {
    let groups = group_by_service(observed);
    let mut steps = Vec::with_capacity(desired.len());

    for spec in desired {
        let revision = spec.revision();
        let instances = groups.get(&spec.id).map(Vec::as_slice).unwrap_or_default();
        let (mut current, mut stale, mut unhealthy, mut starting) = (0u32, 0u32, 0u32, 0u32);
        for instance in instances {
            if instance.revision != revision {
                stale += 1;
            } else if instance.health.is_broken() {
                unhealthy += 1;
            } else {
                if instance.health == InstanceHealth::Starting {
                    starting += 1;
                }
                current += 1;
            }
        }

        let action = if instances.is_empty() {
            StepAction::Create {
                replicas: spec.replicas,
            }
        } else if stale > 0 {
            StepAction::Update {
                revision,
                stale,
                current,
                replicas: spec.replicas,
            }
        } else if unhealthy > 0 || starting > 0 {
            StepAction::Repair {
                unhealthy,
                starting,
                replicas: spec.replicas,
            }
        } else if current != spec.replicas {
            StepAction::Scale {
                from: current,
                to: spec.replicas,
            }
        } else {
            StepAction::Noop
        };
        steps.push(PlanStep {
            service: spec.id,
            action,
        });
    }

    for (service, instances) in &groups {
        if !desired.iter().any(|s| &s.id == service) {
            steps.push(PlanStep {
                service: *service,
                action: StepAction::Remove {
                    instances: instances.len() as u32,
                },
            });
        }
    }

    RolloutPlan { environment, steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_compose::{HealthCheck, ResourceLimits};
    use berth_core::ServiceKind;

    const ENV: EnvironmentName = EnvironmentName::Production;

    fn spec(kind: ServiceKind, image: &str, replicas: u32) -> ServiceSpec {
        ServiceSpec {
            id: ServiceId::new(ENV, kind),
            image: image.to_string(),
            replicas,
            command: vec![],
            env: Default::default(),
            resources: ResourceLimits::default(),
            health: HealthCheck {
                test: vec!["CMD".to_string(), "true".to_string()],
                interval_secs: 5,
                timeout_secs: 3,
                retries: 3,
                start_period_secs: 0,
            },
            depends_on: vec![],
            exposes_traffic: false,
            container_port: None,
            queue: None,
            concurrency: None,
            secrets: None,
        }
    }

    fn running(spec: &ServiceSpec, n: usize) -> ObservedInstance {
        ObservedInstance {
            id: format!("{}-{n}", spec.id.kind),
            service: spec.id,
            image: spec.image.clone(),
            revision: spec.revision(),
            health: InstanceHealth::Healthy,
            address: None,
            port: None,
        }
    }

    #[test]
    fn empty_environment_creates_everything() {
        let desired = vec![spec(ServiceKind::Web, "shop:v1", 2)];
        let plan = diff(ENV, &desired, &[]);
        assert_eq!(
            plan.action(&desired[0].id),
            Some(&StepAction::Create { replicas: 2 })
        );
    }

    #[test]
    fn image_change_is_an_update() {
        let v1 = spec(ServiceKind::Web, "shop:v1", 2);
        let v2 = spec(ServiceKind::Web, "shop:v2", 2);
        let observed = vec![running(&v1, 1), running(&v1, 2)];
        let plan = diff(ENV, &[v2.clone()], &observed);
        assert_eq!(
            plan.action(&v2.id),
            Some(&StepAction::Update {
                revision: v2.revision(),
                stale: 2,
                current: 0,
                replicas: 2,
            })
        );
    }

    #[test]
    fn replica_change_is_a_scale() {
        let v1 = spec(ServiceKind::WorkerDefault, "shop:v1", 1);
        let wanted = spec(ServiceKind::WorkerDefault, "shop:v1", 3);
        let plan = diff(ENV, &[wanted.clone()], &[running(&v1, 1)]);
        assert_eq!(
            plan.action(&wanted.id),
            Some(&StepAction::Scale { from: 1, to: 3 })
        );
    }

    #[test]
    fn broken_current_instance_needs_repair() {
        let cache = spec(ServiceKind::Cache, "redis:7-alpine", 1);
        let mut broken = running(&cache, 1);
        broken.health = InstanceHealth::Unhealthy;
        let plan = diff(ENV, &[cache.clone()], &[broken.clone()]);
        assert_eq!(
            plan.action(&cache.id),
            Some(&StepAction::Repair {
                unhealthy: 1,
                starting: 0,
                replicas: 1,
            })
        );
        assert!(!plan.is_noop());

        broken.health = InstanceHealth::Starting;
        let plan = diff(ENV, &[cache.clone()], &[broken]);
        assert_eq!(
            plan.action(&cache.id),
            Some(&StepAction::Repair {
                unhealthy: 0,
                starting: 1,
                replicas: 1,
            })
        );
    }

    #[test]
    fn update_counts_only_usable_current_instances() {
        let v1 = spec(ServiceKind::Web, "shop:v1", 2);
        let v2 = spec(ServiceKind::Web, "shop:v2", 2);
        let mut gone = running(&v2, 2);
        gone.health = InstanceHealth::Gone;
        let plan = diff(ENV, &[v2.clone()], &[running(&v1, 1), gone]);
        assert_eq!(
            plan.action(&v2.id),
            Some(&StepAction::Update {
                revision: v2.revision(),
                stale: 1,
                current: 0,
                replicas: 2,
            })
        );
    }

    #[test]
    fn undesired_service_is_removed() {
        let web = spec(ServiceKind::Web, "shop:v1", 1);
        let cache = spec(ServiceKind::Cache, "redis:7-alpine", 1);
        let observed = vec![running(&web, 1), running(&cache, 1)];
        let plan = diff(ENV, &[web.clone()], &observed);

        assert_eq!(plan.action(&web.id), Some(&StepAction::Noop));
        let removals: Vec<_> = plan.removals().map(|s| s.service).collect();
        assert_eq!(removals, vec![cache.id]);
    }

    #[test]
    fn converged_environment_is_noop() {
        let web = spec(ServiceKind::Web, "shop:v1", 1);
        let plan = diff(ENV, &[web.clone()], &[running(&web, 1)]);
        assert!(plan.is_noop());
    }
}
