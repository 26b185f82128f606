//! Rollout controller — drives one environment toward its desired specs.
//!
//! A rollout takes the environment lock, validates the dependency graph,
//! observes live instances, diffs, then runs dependency waves. Services in
//! a wave converge concurrently. A service whose dependency failed (or was
//! itself blocked) is left `Pending`. Services that are no longer desired
//! are removed after every desired service was processed.
//!
//! For traffic-serving services an attached `TrafficPublisher` is told the
//! routed instance set before any instance is removed, so requests never
//! point at an instance that is gone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use berth_compose::{ServiceId, ServiceSpec, rollout_waves};
use berth_core::{EnvironmentName, ServiceKind};
use berth_state::StateStore;

use crate::control_plane::{ControlPlane, InstanceHealth, ObservedInstance};
use crate::error::{ControlPlaneResult, RolloutError, ServiceFailure};
use crate::health::wait_healthy;
use crate::lock::{EnvironmentGuard, EnvironmentLocks};
use crate::plan::{self, PlanStep, RolloutPlan, StepAction};
use crate::report::{RolloutResult, ServiceReport, ServiceState};
use crate::strategy::RolloutConfig;
use crate::traffic::TrafficPublisher;

pub struct RolloutController {
    control_plane: Arc<dyn ControlPlane>,
    traffic: Option<Arc<dyn TrafficPublisher>>,
    store: StateStore,
    locks: EnvironmentLocks,
    config: RolloutConfig,
    /// Report of the current or last rollout per environment.
    live: Mutex<HashMap<EnvironmentName, RolloutResult>>,
}

impl RolloutController {
    pub fn new(control_plane: Arc<dyn ControlPlane>, store: StateStore, config: RolloutConfig) -> Self {
        Self {
            control_plane,
            traffic: None,
            store,
            locks: EnvironmentLocks::new(),
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Hand traffic of replaced services to `publisher` before removals.
    pub fn with_traffic(mut self, publisher: Arc<dyn TrafficPublisher>) -> Self {
        self.traffic = Some(publisher);
        self
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Converge `env` toward `desired`.
    ///
    /// Systemic failures (lock held, invalid graph, control plane
    /// unreachable) are errors returned before anything is mutated.
    /// Per-service failures end up in a `Partial` result instead.
    pub async fn rollout(
        &self,
        env: EnvironmentName,
        desired: Vec<ServiceSpec>,
    ) -> Result<RolloutResult, RolloutError> {
        let guard = self.locks.try_acquire(env)?;

        if let Some(foreign) = desired.iter().find(|s| s.id.environment != env) {
            return Err(RolloutError::Precondition {
                environment: env,
                reason: format!("spec {} belongs to another environment", foreign.id),
            });
        }
        let waves = rollout_waves(&desired)?;
        let observed = self.observe(env).await?;
        let plan = plan::diff(env, &desired, &observed);

        info!(
            environment = %env,
            services = desired.len(),
            waves = waves.len(),
            removals = plan.removals().count(),
            "starting rollout"
        );
        Ok(self.execute(&guard, &desired, &waves, plan, observed).await)
    }

    /// Re-apply the previously converged spec of one service.
    pub async fn rollback(
        &self,
        env: EnvironmentName,
        kind: ServiceKind,
    ) -> Result<RolloutResult, RolloutError> {
        let guard = self.locks.try_acquire(env)?;
        let id = ServiceId::new(env, kind);

        let previous = self
            .store
            .get_history(&id)?
            .and_then(|history| history.previous)
            .ok_or_else(|| RolloutError::NoHistory(id.to_string()))?;

        let observed: Vec<_> = self
            .observe(env)
            .await?
            .into_iter()
            .filter(|i| i.service == id)
            .collect();
        let desired = vec![previous];
        let plan = plan::diff(env, &desired, &observed);

        info!(
            environment = %env,
            service = %id,
            revision = %desired[0].revision(),
            "starting rollback"
        );
        Ok(self.execute(&guard, &desired, &[vec![id]], plan, observed).await)
    }

    /// Compute the plan a rollout of `desired` would execute.
    pub async fn plan(
        &self,
        env: EnvironmentName,
        desired: &[ServiceSpec],
    ) -> Result<RolloutPlan, RolloutError> {
        rollout_waves(desired)?;
        let observed = self.observe(env).await?;
        Ok(plan::diff(env, desired, &observed))
    }

    /// Ask the in-flight rollout of `env` to stop. Returns false when no
    /// rollout is running.
    pub fn cancel(&self, env: EnvironmentName) -> bool {
        self.locks.cancel(env)
    }

    pub fn is_running(&self, env: EnvironmentName) -> bool {
        self.locks.is_held(env)
    }

    /// Report of the current or most recent rollout of `env`.
    pub fn status(&self, env: EnvironmentName) -> Result<Option<RolloutResult>, RolloutError> {
        if let Some(report) = self.live.lock().expect("live reports").get(&env) {
            return Ok(Some(report.clone()));
        }
        Ok(self.store.get_rollout_report(env)?)
    }

    // ── Execution ──────────────────────────────────────────────────

    async fn execute(
        &self,
        guard: &EnvironmentGuard,
        desired: &[ServiceSpec],
        waves: &[Vec<ServiceId>],
        plan: RolloutPlan,
        observed: Vec<ObservedInstance>,
    ) -> RolloutResult {
        let env = guard.environment();
        let reports = plan
            .steps
            .iter()
            .map(|step| ServiceReport {
                service: step.service,
                action: step.action.clone(),
                state: ServiceState::Pending,
                failure: None,
            })
            .collect();
        self.live
            .lock()
            .expect("live reports")
            .insert(env, RolloutResult::start(env, reports));

        let mut groups = plan::group_by_service(&observed);
        let specs: BTreeMap<ServiceId, &ServiceSpec> = desired.iter().map(|s| (s.id, s)).collect();
        let mut blocked: BTreeSet<ServiceId> = BTreeSet::new();

        for wave in waves {
            if guard.is_cancelled() {
                info!(environment = %env, "rollout cancelled between waves");
                break;
            }

            let mut runnable = Vec::new();
            for id in wave {
                let Some(spec) = specs.get(id) else { continue };
                if let Some(dep) = spec.depends_on.iter().find(|d| blocked.contains(d)) {
                    debug!(service = %id, dependency = %dep, "blocked by failed dependency");
                    blocked.insert(*id);
                    continue;
                }
                let action = plan.action(id).cloned().unwrap_or(StepAction::Noop);
                let instances = groups.remove(id).unwrap_or_default();
                runnable.push((*spec, action, instances));
            }

            let results = join_all(runnable.into_iter().map(|(spec, action, instances)| {
                self.converge(spec, action, instances, guard.cancellation())
            }))
            .await;

            for (id, ok) in results {
                if !ok {
                    blocked.insert(id);
                }
            }
        }

        for step in plan.removals() {
            if guard.is_cancelled() {
                break;
            }
            let instances = groups.remove(&step.service).unwrap_or_default();
            self.remove_service(step, instances).await;
        }

        let result = {
            let mut live = self.live.lock().expect("live reports");
            match live.get_mut(&env) {
                Some(report) => {
                    report.finish();
                    report.clone()
                }
                None => RolloutResult::start(env, Vec::new()),
            }
        };

        if let Err(e) = self.store.put_rollout_report(env, &result) {
            warn!(environment = %env, error = %e, "failed to persist rollout report");
        }
        info!(
            environment = %env,
            outcome = ?result.outcome,
            failed = result.failed().len(),
            pending = result.pending().len(),
            "rollout finished"
        );
        result
    }

    /// Converge one service. Returns its id and whether it ended healthy.
    async fn converge(
        &self,
        spec: &ServiceSpec,
        action: StepAction,
        instances: Vec<ObservedInstance>,
        mut cancel: watch::Receiver<bool>,
    ) -> (ServiceId, bool) {
        let id = spec.id;
        self.set_state(id, ServiceState::Converging, None);
        debug!(service = %id, %action, "converging");

        let outcome = match action {
            StepAction::Noop => Ok(()),
            _ => self.replace(spec, instances, &mut cancel).await,
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.store.record_converged(spec) {
                    error!(service = %id, error = %e, "failed to record spec history");
                }
                self.set_state(id, ServiceState::Healthy, None);
                info!(service = %id, revision = %spec.revision(), "service converged");
                (id, true)
            }
            Err(failure) => {
                warn!(service = %id, %failure, "service failed to converge");
                self.set_state(id, ServiceState::Failed, Some(failure));
                (id, false)
            }
        }
    }

    /// Incremental replacement: create one current instance, wait for it
    /// to pass the health gate, move traffic, remove one stale instance,
    /// repeat. Broken instances of the current revision count as stale and
    /// starting ones must pass the gate first. Leftover stale instances
    /// are removed afterwards and missing replicas are created
    /// (health-gated), so creates, updates, repairs and scales all go
    /// through here.
    async fn replace(
        &self,
        spec: &ServiceSpec,
        instances: Vec<ObservedInstance>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ServiceFailure> {
        let revision = spec.revision();
        let target = spec.replicas as usize;
        let mut current = Vec::new();
        let mut stale = Vec::new();

        for mut instance in instances {
            if instance.revision != revision || instance.health.is_broken() {
                stale.push(instance);
                continue;
            }
            if instance.health == InstanceHealth::Starting {
                match wait_healthy(self.control_plane.as_ref(), &instance.id, &self.config, cancel)
                    .await
                {
                    Ok(()) => instance.health = InstanceHealth::Healthy,
                    Err(ServiceFailure::Cancelled) => return Err(ServiceFailure::Cancelled),
                    Err(failure) => {
                        warn!(
                            service = %spec.id,
                            instance = %instance.id,
                            %failure,
                            "replacing instance that never became healthy"
                        );
                        instance.health = InstanceHealth::Unhealthy;
                        stale.push(instance);
                        continue;
                    }
                }
            }
            current.push(instance);
        }

        // Unhealthy instances go first; removing them costs no capacity.
        stale.sort_by_key(|i| i.health == InstanceHealth::Healthy);
        current.sort_by_key(|i| i.health == InstanceHealth::Healthy);
        let mut stale: Vec<String> = stale.into_iter().map(|i| i.id).collect();
        let mut current: Vec<String> = current.into_iter().map(|i| i.id).collect();

        while !stale.is_empty() && current.len() < target {
            current.push(self.create_gated(spec, cancel).await?);
            let old = stale.remove(0);
            let routed: Vec<String> = current.iter().chain(&stale).cloned().collect();
            self.hand_off(spec, &routed).await?;
            self.remove_instance(spec.id, &old, cancel).await?;
        }
        if !stale.is_empty() {
            self.hand_off(spec, &current).await?;
        }
        for old in std::mem::take(&mut stale) {
            self.remove_instance(spec.id, &old, cancel).await?;
        }
        while current.len() < target {
            current.push(self.create_gated(spec, cancel).await?);
        }
        while current.len() > target {
            let extra = current.remove(0);
            self.hand_off(spec, &current).await?;
            self.remove_instance(spec.id, &extra, cancel).await?;
        }
        self.hand_off(spec, &current).await
    }

    /// Route the service's traffic to exactly the `routed` instances and
    /// wait until that is live. Without a publisher, or for services that
    /// serve no traffic, there is nothing to move.
    async fn hand_off(&self, spec: &ServiceSpec, routed: &[String]) -> Result<(), ServiceFailure> {
        let Some(traffic) = self.traffic.as_ref().filter(|_| spec.exposes_traffic) else {
            return Ok(());
        };
        let instances: Vec<ObservedInstance> = self
            .call("observe", self.control_plane.observe(spec.id.environment))
            .await?
            .into_iter()
            .filter(|i| i.service == spec.id && routed.contains(&i.id))
            .collect();

        match timeout(self.config.call_deadline(), traffic.publish(spec.id, &instances)).await {
            Ok(Ok(())) => {
                debug!(service = %spec.id, instances = instances.len(), "traffic handed off");
                Ok(())
            }
            Ok(Err(e)) => Err(ServiceFailure::Traffic {
                reason: e.to_string(),
            }),
            Err(_) => Err(ServiceFailure::Traffic {
                reason: format!("no answer within {}s", self.config.call_deadline_secs),
            }),
        }
    }

    /// Create one instance and wait for it to pass the health gate. An
    /// instance that misses the gate is torn down again.
    async fn create_gated(
        &self,
        spec: &ServiceSpec,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, ServiceFailure> {
        check_cancel(cancel)?;
        let id = self
            .call("create", self.control_plane.create_instance(spec))
            .await?;
        debug!(service = %spec.id, instance = %id, "instance created");

        match wait_healthy(self.control_plane.as_ref(), &id, &self.config, cancel).await {
            Ok(()) => {
                debug!(service = %spec.id, instance = %id, "instance healthy");
                Ok(id)
            }
            Err(failure) => {
                if let Err(e) = self
                    .call("remove", self.control_plane.remove_instance(&id))
                    .await
                {
                    warn!(instance = %id, error = %e, "failed to tear down unhealthy instance");
                }
                Err(failure)
            }
        }
    }

    async fn remove_instance(
        &self,
        service: ServiceId,
        id: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), ServiceFailure> {
        check_cancel(cancel)?;
        self.call("remove", self.control_plane.remove_instance(id))
            .await?;
        debug!(%service, instance = id, "instance removed");
        Ok(())
    }

    async fn remove_service(&self, step: &PlanStep, instances: Vec<ObservedInstance>) {
        self.set_state(step.service, ServiceState::Converging, None);
        for instance in &instances {
            if let Err(failure) = self
                .call("remove", self.control_plane.remove_instance(&instance.id))
                .await
            {
                warn!(service = %step.service, %failure, "failed to remove service");
                self.set_state(step.service, ServiceState::Failed, Some(failure));
                return;
            }
        }
        info!(service = %step.service, instances = instances.len(), "service removed");
        self.set_state(step.service, ServiceState::Removed, None);
    }

    // ── Helpers ────────────────────────────────────────────────────

    async fn observe(&self, env: EnvironmentName) -> Result<Vec<ObservedInstance>, RolloutError> {
        match timeout(self.config.call_deadline(), self.control_plane.observe(env)).await {
            Ok(Ok(instances)) => Ok(instances),
            Ok(Err(e)) => Err(RolloutError::Precondition {
                environment: env,
                reason: format!("cannot observe live instances: {e}"),
            }),
            Err(_) => Err(RolloutError::Precondition {
                environment: env,
                reason: format!(
                    "control plane did not answer within {}s",
                    self.config.call_deadline_secs
                ),
            }),
        }
    }

    /// Run one control-plane call under the call deadline.
    async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = ControlPlaneResult<T>>,
    ) -> Result<T, ServiceFailure> {
        match timeout(self.config.call_deadline(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ServiceFailure::control_plane(operation, e)),
            Err(_) => Err(ServiceFailure::control_plane(
                operation,
                format!("no answer within {}s", self.config.call_deadline_secs),
            )),
        }
    }

    fn set_state(&self, service: ServiceId, state: ServiceState, failure: Option<ServiceFailure>) {
        let mut live = self.live.lock().expect("live reports");
        if let Some(report) = live.get_mut(&service.environment) {
            report.set_state(service, state, failure);
        }
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), ServiceFailure> {
    if *cancel.borrow() {
        return Err(ServiceFailure::Cancelled);
    }
    Ok(())
}
