//! Daemon — assembles the subsystems behind one topology.
//!
//! Shared by the one-shot CLI commands and `serve`. A deployment is
//! compose → rollout → publish web backends → proxy reload. During the
//! rollout the proxy follows every web replacement step through
//! `ProxyPublisher`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use berth_certs::{CertConfig, CertResult, CertificateAuthority, CertificateManager, PassReport};
use berth_compose::{ComposeError, ServiceId, compose};
use berth_core::{EnvironmentName, ServiceKind, Topology};
use berth_proxy::{Backend, ProxyError, ProxyRouter, ProxySink, RenderOptions, TlsStore};
use berth_rollout::{
    ControlPlane, ControlPlaneError, InstanceHealth, ObservedInstance, RolloutConfig,
    RolloutController, RolloutError, RolloutResult, TrafficError, TrafficPublisher,
};
use berth_state::{CertificateRecord, StateStore};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("environment {0} is not declared or not enabled")]
    NotDeployable(EnvironmentName),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot observe web instances: {0}")]
    Observe(#[from] ControlPlaneError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Result of a rollout plus the proxy update that followed it.
#[derive(Debug)]
pub struct Deployment {
    pub result: RolloutResult,
    /// Healthy web backends now routed, or why the proxy was not updated.
    pub published: Result<usize, PublishError>,
}

#[derive(Debug, Serialize)]
pub struct DeploymentView<'a> {
    #[serde(flatten)]
    pub result: &'a RolloutResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backends: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_error: Option<String>,
}

impl Deployment {
    pub fn view(&self) -> DeploymentView<'_> {
        DeploymentView {
            result: &self.result,
            backends: self.published.as_ref().ok().copied(),
            proxy_error: self.published.as_ref().err().map(|e| e.to_string()),
        }
    }
}

/// Tunables of the assembled subsystems.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub rollout: RolloutConfig,
    pub certs: CertConfig,
    pub render: RenderOptions,
}

pub struct Daemon {
    topology: Arc<Topology>,
    controller: RolloutController,
    router: Arc<ProxyRouter>,
    certs: CertificateManager,
}

impl Daemon {
    pub fn new(
        topology: Topology,
        control_plane: Arc<dyn ControlPlane>,
        sink: Arc<dyn ProxySink>,
        authority: Arc<dyn CertificateAuthority>,
        store: StateStore,
        config: DaemonConfig,
    ) -> Self {
        let router = Arc::new(ProxyRouter::new(sink, Arc::new(TlsStore::new()), config.render));
        router.reconcile_routes(&topology);
        let controller = RolloutController::new(control_plane, store.clone(), config.rollout)
            .with_traffic(Arc::new(ProxyPublisher {
                router: Arc::clone(&router),
            }));
        let certs = CertificateManager::new(authority, store, Arc::clone(&router), config.certs);
        Self {
            topology: Arc::new(topology),
            controller,
            router,
            certs,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Load what is already live into the proxy state: persisted TLS
    /// material and the running web instances of every enabled
    /// environment. Nothing is activated.
    pub async fn sync_live_state(&self) {
        if let Err(e) = self.certs.restore_material() {
            warn!(error = %e, "cannot restore certificate material");
        }
        for env in self.topology.enabled_environments() {
            match self.collect_backends(env.name).await {
                Ok(backends) => self.router.set_backends(env.name, backends),
                Err(e) => warn!(environment = %env.name, error = %e, "cannot observe web instances"),
            }
        }
    }

    /// `sync_live_state` followed by a reload.
    pub async fn prime(&self) -> Result<(), PublishError> {
        self.sync_live_state().await;
        self.router.reload().await?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    pub async fn deploy(&self, env: EnvironmentName) -> Result<Deployment, DeployError> {
        let environment = self
            .topology
            .environment(env)
            .filter(|e| e.enabled)
            .ok_or(DeployError::NotDeployable(env))?;
        let specs = compose(environment)?;
        let result = self.controller.rollout(env, specs).await?;
        let published = self.publish(env).await;
        Ok(Deployment { result, published })
    }

    pub async fn rollback(
        &self,
        env: EnvironmentName,
        kind: ServiceKind,
    ) -> Result<Deployment, DeployError> {
        let result = self.controller.rollback(env, kind).await?;
        let published = if kind == ServiceKind::Web {
            self.publish(env).await
        } else {
            Ok(0)
        };
        Ok(Deployment { result, published })
    }

    pub fn cancel(&self, env: EnvironmentName) -> bool {
        self.controller.cancel(env)
    }

    pub fn status(&self, env: EnvironmentName) -> Result<Option<RolloutResult>, RolloutError> {
        self.controller.status(env)
    }

    /// Route `env`'s domains to its healthy web instances.
    pub async fn publish(&self, env: EnvironmentName) -> Result<usize, PublishError> {
        let backends = self.collect_backends(env).await?;
        let healthy = backends.iter().filter(|b| b.healthy).count();
        self.router.set_backends(env, backends);
        self.router.reload().await?;
        info!(environment = %env, healthy, "web backends published");
        Ok(healthy)
    }

    async fn collect_backends(&self, env: EnvironmentName) -> Result<Vec<Backend>, ControlPlaneError> {
        let instances = self.controller.control_plane().observe(env).await?;
        let backends = backends_of(instances);
        debug!(environment = %env, backends = backends.len(), "web backends observed");
        Ok(backends)
    }

    // ── Certificates ───────────────────────────────────────────────

    pub async fn certificate_pass(&self) -> CertResult<PassReport> {
        self.certs.run_pass(&self.topology).await
    }

    pub fn certificates(&self) -> CertResult<Vec<CertificateRecord>> {
        self.certs.records()
    }

    /// Scheduled certificate passes until `shutdown` flips.
    pub async fn run_certificates(&self, shutdown: watch::Receiver<bool>) {
        // Held for the loop's lifetime; the topology never changes in-process.
        let (_topology_tx, topology_rx) = watch::channel(Arc::clone(&self.topology));
        self.certs.run(topology_rx, shutdown).await;
    }
}

/// Routes web traffic to the instance set the controller hands over and
/// reloads the proxy before the controller removes anything.
struct ProxyPublisher {
    router: Arc<ProxyRouter>,
}

#[async_trait]
impl TrafficPublisher for ProxyPublisher {
    async fn publish(
        &self,
        service: ServiceId,
        instances: &[ObservedInstance],
    ) -> Result<(), TrafficError> {
        let backends = backends_of(instances.iter().cloned());
        let healthy = backends.iter().filter(|b| b.healthy).count();
        self.router.set_backends(service.environment, backends);
        self.router
            .reload()
            .await
            .map_err(|e| TrafficError(e.to_string()))?;
        debug!(%service, healthy, "web traffic moved");
        Ok(())
    }
}

/// Web instances that publish an address, as proxy backends.
fn backends_of(instances: impl IntoIterator<Item = ObservedInstance>) -> Vec<Backend> {
    instances
        .into_iter()
        .filter(|i| i.service.kind == ServiceKind::Web)
        .filter_map(|i| {
            Some(Backend {
                healthy: i.health == InstanceHealth::Healthy,
                address: i.address?,
                port: i.port?,
                instance_id: i.id,
            })
        })
        .collect()
}
