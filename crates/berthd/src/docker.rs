//! Docker control plane.
//!
//! Instances are containers labelled with the project, environment,
//! service and spec revision they were created from. Each environment
//! gets its own bridge network in which a service is reachable under its
//! catalogue name (`cache`, `worker-default`, ...). The web tier publishes
//! its container port on an ephemeral loopback port the proxy targets.

// bollard 0.19 still ships the old option structs alongside the generated
// query parameters.
#![allow(deprecated)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig};
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerSummary, EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig,
    NetworkCreateRequest, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use berth_compose::{ServiceId, ServiceSpec};
use berth_core::{EnvironmentName, ServiceKind};
use berth_rollout::{
    ControlPlane, ControlPlaneError, ControlPlaneResult, InstanceHealth, ObservedInstance,
};

pub const LABEL_PROJECT: &str = "berth.project";
pub const LABEL_ENVIRONMENT: &str = "berth.environment";
pub const LABEL_SERVICE: &str = "berth.service";
pub const LABEL_REVISION: &str = "berth.revision";

const NANOS_PER_SEC: i64 = 1_000_000_000;

pub struct DockerControlPlane {
    docker: Docker,
    project: String,
    /// Networks known to exist.
    networks: Mutex<HashSet<String>>,
    seq: AtomicU64,
}

impl DockerControlPlane {
    /// Connect to the local engine (socket or `DOCKER_HOST`). Nothing is
    /// contacted until the first call.
    pub fn connect(project: &str) -> ControlPlaneResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;
        Ok(Self {
            docker,
            project: project.to_string(),
            networks: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(epoch_millis()),
        })
    }

    async fn ensure_network(&self, name: &str) -> ControlPlaneResult<()> {
        if self.networks.lock().expect("networks lock").contains(name) {
            return Ok(());
        }
        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ..Default::default()
        };
        match self.docker.create_network(request).await {
            Ok(_) => info!(network = name, "network created"),
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!(network = name, "network exists"),
            Err(e) => return Err(map_docker_err("create network", e)),
        }
        self.networks
            .lock()
            .expect("networks lock")
            .insert(name.to_string());
        Ok(())
    }

    async fn pull(&self, image: &str) -> ControlPlaneResult<()> {
        let (from_image, tag) = split_image(image);
        info!(image, "pulling image");
        let options = bollard::image::CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| map_docker_err("pull", e))?;
        }
        Ok(())
    }

    async fn create_and_start(
        &self,
        config: &Config<String>,
        options: &CreateContainerOptions<String>,
    ) -> Result<String, DockerError> {
        let created = self
            .docker
            .create_container(Some(options.clone()), config.clone())
            .await?;
        self.docker
            .start_container(
                &created.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await?;
        Ok(created.id)
    }

    fn container_name(&self, spec: &ServiceSpec) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}-{}-{}-{}-{seq:x}",
            self.project,
            spec.id.environment,
            spec.id.kind,
            &spec.revision()[..6]
        )
    }
}

#[async_trait]
impl ControlPlane for DockerControlPlane {
    async fn observe(&self, env: EnvironmentName) -> ControlPlaneResult<Vec<ObservedInstance>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{LABEL_PROJECT}={}", self.project),
                format!("{LABEL_ENVIRONMENT}={env}"),
            ],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_docker_err("list containers", e))?;

        Ok(containers
            .iter()
            .filter_map(|c| observed_from_summary(env, c))
            .collect())
    }

    async fn create_instance(&self, spec: &ServiceSpec) -> ControlPlaneResult<String> {
        let network = network_name(&self.project, spec.id.environment);
        self.ensure_network(&network).await?;

        let secrets = match &spec.secrets {
            Some(secret) => read_env_file(Path::new(&secret.0)).await.map_err(|reason| {
                ControlPlaneError::Rejected {
                    operation: format!("create {}", spec.id),
                    reason,
                }
            })?,
            None => Vec::new(),
        };
        let name = self.container_name(spec);
        let (config, options) = container_config(&self.project, spec, &name, secrets);

        let id = match self.create_and_start(&config, &options).await {
            Ok(id) => id,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Image not present locally.
                self.pull(&spec.image).await?;
                self.create_and_start(&config, &options)
                    .await
                    .map_err(|e| map_docker_err("create container", e))?
            }
            Err(e) => return Err(map_docker_err("create container", e)),
        };
        info!(service = %spec.id, container = %name, "container started");
        Ok(id)
    }

    async fn instance_health(&self, id: &str) -> ControlPlaneResult<InstanceHealth> {
        let inspected = match self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(inspected) => inspected,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(InstanceHealth::Gone),
            Err(e) => return Err(map_docker_err("inspect container", e)),
        };

        let Some(state) = inspected.state else {
            return Ok(InstanceHealth::Gone);
        };
        if !state.running.unwrap_or(false) {
            return Ok(InstanceHealth::Unhealthy);
        }
        let status = state.health.and_then(|h| h.status);
        Ok(match status {
            Some(HealthStatusEnum::HEALTHY) => InstanceHealth::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => InstanceHealth::Unhealthy,
            Some(HealthStatusEnum::STARTING) => InstanceHealth::Starting,
            // No health check configured: running is as good as it gets.
            _ => InstanceHealth::Healthy,
        })
    }

    async fn remove_instance(&self, id: &str) -> ControlPlaneResult<()> {
        match self
            .docker
            .stop_container(id, None::<bollard::query_parameters::StopContainerOptions>)
            .await
        {
            Ok(()) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => return Err(map_docker_err("stop container", e)),
        }
        match self
            .docker
            .remove_container(id, None::<bollard::query_parameters::RemoveContainerOptions>)
            .await
        {
            Ok(()) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(container = id, "container already gone"),
            Err(e) => return Err(map_docker_err("remove container", e)),
        }
        info!(container = id, "container removed");
        Ok(())
    }
}

// ── Conversion ─────────────────────────────────────────────────────

pub fn network_name(project: &str, env: EnvironmentName) -> String {
    format!("{project}-{env}")
}

/// Container settings for one instance of `spec`.
pub fn container_config(
    project: &str,
    spec: &ServiceSpec,
    name: &str,
    secrets: Vec<String>,
) -> (Config<String>, CreateContainerOptions<String>) {
    let network = network_name(project, spec.id.environment);

    // Later entries win, so berth's own variables override the bundle.
    let mut env = secrets;
    env.extend(spec.env.iter().map(|(k, v)| format!("{k}={v}")));

    let mut labels = HashMap::new();
    labels.insert(LABEL_PROJECT.to_string(), project.to_string());
    labels.insert(LABEL_ENVIRONMENT.to_string(), spec.id.environment.to_string());
    labels.insert(LABEL_SERVICE.to_string(), spec.id.kind.to_string());
    labels.insert(LABEL_REVISION.to_string(), spec.revision());

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    if let (true, Some(port)) = (spec.exposes_traffic, spec.container_port) {
        let key = format!("{port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        // No host port: the engine picks a free one.
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );
    }

    let host_config = HostConfig {
        network_mode: Some(network.clone()),
        port_bindings: Some(port_bindings),
        memory: spec.resources.memory_mb.map(|mb| i64::from(mb) * 1024 * 1024),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    let health = &spec.health;
    let healthcheck = HealthConfig {
        test: Some(health.test.clone()),
        interval: Some(secs_to_nanos(health.interval_secs)),
        timeout: Some(secs_to_nanos(health.timeout_secs)),
        retries: Some(i64::from(health.retries)),
        start_period: Some(secs_to_nanos(health.start_period_secs)),
        ..Default::default()
    };

    let mut endpoints = HashMap::new();
    endpoints.insert(
        network,
        EndpointSettings {
            aliases: Some(vec![spec.id.kind.to_string()]),
            ..Default::default()
        },
    );

    let config = Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        healthcheck: Some(healthcheck),
        host_config: Some(host_config),
        networking_config: Some(NetworkingConfig {
            endpoints_config: endpoints,
        }),
        ..Default::default()
    };
    let options = CreateContainerOptions {
        name: name.to_string(),
        platform: None,
    };
    (config, options)
}

fn observed_from_summary(env: EnvironmentName, summary: &ContainerSummary) -> Option<ObservedInstance> {
    let id = summary.id.clone()?;
    let labels = summary.labels.as_ref()?;
    let kind = match labels.get(LABEL_SERVICE)?.parse::<ServiceKind>() {
        Ok(kind) => kind,
        Err(e) => {
            warn!(container = %id, error = %e, "ignoring container with unknown service label");
            return None;
        }
    };
    let published = summary
        .ports
        .as_ref()
        .and_then(|ports| ports.iter().find(|p| p.public_port.is_some()));

    Some(ObservedInstance {
        id,
        service: ServiceId::new(env, kind),
        image: summary.image.clone().unwrap_or_default(),
        revision: labels.get(LABEL_REVISION).cloned().unwrap_or_default(),
        health: health_from_status(summary.status.as_deref().unwrap_or_default()),
        address: published.map(|p| match p.ip.as_deref() {
            Some("0.0.0.0") | Some("::") | None => "127.0.0.1".to_string(),
            Some(ip) => ip.to_string(),
        }),
        port: published.and_then(|p| p.public_port),
    })
}

/// Health from the engine's human status, e.g. `Up 3 minutes (healthy)`.
pub fn health_from_status(status: &str) -> InstanceHealth {
    if !status.starts_with("Up") {
        return InstanceHealth::Gone;
    }
    if status.contains("(unhealthy)") {
        InstanceHealth::Unhealthy
    } else if status.contains("(health: starting)") {
        InstanceHealth::Starting
    } else {
        InstanceHealth::Healthy
    }
}

fn map_docker_err(operation: &str, e: DockerError) -> ControlPlaneError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ControlPlaneError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ControlPlaneError::Rejected {
            operation: operation.to_string(),
            reason: format!("{status_code}: {message}"),
        },
        other => ControlPlaneError::Unreachable(format!("{operation}: {other}")),
    }
}

/// `registry:5000/app:v2` → (`registry:5000/app`, `v2`).
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

/// `KEY=VALUE` lines of a secret bundle. Blank lines and `#` comments are
/// skipped.
async fn read_env_file(path: &Path) -> Result<Vec<String>, String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read secrets {}: {e}", path.display()))?;
    parse_env_lines(&content).map_err(|line| format!("{}:{line}: expected KEY=VALUE", path.display()))
}

fn parse_env_lines(content: &str) -> Result<Vec<String>, usize> {
    let mut vars = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                let value = value.trim().trim_matches('"');
                vars.push(format!("{}={value}", key.trim()));
            }
            _ => return Err(n + 1),
        }
    }
    Ok(vars)
}

fn secs_to_nanos(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / NANOS_PER_SEC) * NANOS_PER_SEC
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
