//! Stack composer — maps an `Environment` onto the fixed service catalogue.
//!
//! Composition is pure. The only rules it enforces on its own (rather than
//! trusting configuration) are the singleton clamps: at most one scheduler
//! instance per environment, since a second one would fire every periodic
//! task twice, and at most one cache, since replicas behind one alias would
//! be independent brokers.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use berth_core::{Environment, ServiceKind, ServiceSizing};

use crate::error::ComposeError;
use crate::spec::{HealthCheck, ResourceLimits, ServiceId, ServiceSpec};

/// Port the application server listens on inside the web container.
pub const WEB_CONTAINER_PORT: u16 = 8000;
pub const CACHE_PORT: u16 = 6379;
pub const MONITOR_PORT: u16 = 5555;

/// Compose the service specs for one environment, in catalogue order.
pub fn compose(env: &Environment) -> Result<Vec<ServiceSpec>, ComposeError> {
    let selection = &env.services;
    let cache_enabled = selection.is_enabled(ServiceKind::Cache);
    let cache_id = ServiceId::new(env.name, ServiceKind::Cache);
    let shared_env = shared_env(env, cache_enabled);

    let mut specs = vec![web_spec(env, &shared_env)];

    if let Some(cache) = active(selection.cache.as_ref()) {
        specs.push(cache_spec(env, cache));
    }

    let workers = selection.enabled_workers();
    for kind in &workers {
        if let Some(sizing) = active(selection.sizing(*kind)) {
            let mut spec = worker_spec(env, *kind, sizing, &shared_env);
            if cache_enabled {
                spec.depends_on.push(cache_id);
            }
            specs.push(spec);
        }
    }

    if let Some(scheduler) = active(selection.scheduler.as_ref()) {
        let mut spec = scheduler_spec(env, scheduler, &shared_env);
        // The cache doubles as the result backend when present.
        if cache_enabled {
            spec.depends_on.push(cache_id);
        }
        specs.push(spec);
    }

    if let Some(monitor) = active(selection.monitor.as_ref()) {
        if workers.is_empty() {
            return Err(ComposeError::MonitorWithoutWorkers(env.name.to_string()));
        }
        let mut spec = monitor_spec(env, monitor, &shared_env);
        spec.depends_on = workers
            .iter()
            .map(|kind| ServiceId::new(env.name, *kind))
            .collect();
        specs.push(spec);
    }

    debug!(
        environment = %env.name,
        services = specs.len(),
        "composed environment"
    );
    Ok(specs)
}

fn active(sizing: Option<&ServiceSizing>) -> Option<&ServiceSizing> {
    sizing.filter(|s| s.is_active())
}

/// Variables every application process receives.
fn shared_env(env: &Environment, cache_enabled: bool) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("DEPLOY_ENVIRONMENT".to_string(), env.name.to_string());
    vars.insert("ALLOWED_HOSTS".to_string(), env.domains().collect::<Vec<_>>().join(","));
    if cache_enabled {
        let host = ServiceKind::Cache.as_str();
        vars.insert("BROKER_URL".to_string(), format!("redis://{host}:{CACHE_PORT}/0"));
        vars.insert("RESULT_BACKEND".to_string(), format!("redis://{host}:{CACHE_PORT}/0"));
        vars.insert("CACHE_URL".to_string(), format!("redis://{host}:{CACHE_PORT}/1"));
    }
    vars
}

fn health(test: &[&str], start_period_secs: u64) -> HealthCheck {
    HealthCheck {
        test: test.iter().map(|s| s.to_string()).collect(),
        interval_secs: 5,
        timeout_secs: 3,
        retries: 3,
        start_period_secs,
    }
}

fn web_spec(env: &Environment, shared: &BTreeMap<String, String>) -> ServiceSpec {
    let web = &env.services.web;
    let mut vars = shared.clone();
    vars.insert("PORT".to_string(), WEB_CONTAINER_PORT.to_string());
    vars.insert("WEB_CONCURRENCY".to_string(), web.concurrency.to_string());

    let probe = format!(
        "curl -fsS http://localhost:{WEB_CONTAINER_PORT}{} || exit 1",
        env.health_path
    );

    ServiceSpec {
        id: ServiceId::new(env.name, ServiceKind::Web),
        image: env.images.app.clone(),
        replicas: web.replicas,
        command: vec![],
        env: vars,
        resources: ResourceLimits {
            memory_mb: web.memory_mb,
        },
        health: health(&["CMD-SHELL", &probe], 15),
        depends_on: vec![],
        exposes_traffic: true,
        container_port: Some(WEB_CONTAINER_PORT),
        queue: None,
        concurrency: Some(web.concurrency),
        secrets: env.secrets.clone(),
    }
}

fn cache_spec(env: &Environment, sizing: &ServiceSizing) -> ServiceSpec {
    let mut command = vec![
        "redis-server".to_string(),
        "--appendonly".to_string(),
        "yes".to_string(),
    ];
    if let Some(mb) = sizing.memory_mb {
        command.extend(["--maxmemory".to_string(), format!("{mb}mb")]);
    }
    if sizing.replicas > 1 {
        warn!(
            environment = %env.name,
            configured = sizing.replicas,
            "cache replicas clamped to 1"
        );
    }

    ServiceSpec {
        id: ServiceId::new(env.name, ServiceKind::Cache),
        image: env.images.cache.clone(),
        replicas: 1,
        command,
        env: BTreeMap::new(),
        resources: ResourceLimits {
            memory_mb: sizing.memory_mb,
        },
        health: health(&["CMD", "redis-cli", "ping"], 5),
        depends_on: vec![],
        exposes_traffic: false,
        container_port: Some(CACHE_PORT),
        queue: None,
        concurrency: None,
        secrets: None,
    }
}

fn worker_spec(
    env: &Environment,
    kind: ServiceKind,
    sizing: &ServiceSizing,
    shared: &BTreeMap<String, String>,
) -> ServiceSpec {
    let queue = sizing.queue.clone().unwrap_or_else(|| "default".to_string());
    let node = format!("{queue}@%h");
    let probe = format!(
        "celery -A {} inspect ping -d {queue}@$HOSTNAME || exit 1",
        env.app_module
    );

    ServiceSpec {
        id: ServiceId::new(env.name, kind),
        image: env.images.app.clone(),
        replicas: sizing.replicas,
        command: vec![
            "celery".to_string(),
            "-A".to_string(),
            env.app_module.clone(),
            "worker".to_string(),
            "-Q".to_string(),
            queue.clone(),
            "-c".to_string(),
            sizing.concurrency.to_string(),
            "-n".to_string(),
            node,
        ],
        env: shared.clone(),
        resources: ResourceLimits {
            memory_mb: sizing.memory_mb,
        },
        health: health(&["CMD-SHELL", &probe], 20),
        depends_on: vec![],
        exposes_traffic: false,
        container_port: None,
        queue: Some(queue),
        concurrency: Some(sizing.concurrency),
        secrets: env.secrets.clone(),
    }
}

fn scheduler_spec(
    env: &Environment,
    sizing: &ServiceSizing,
    shared: &BTreeMap<String, String>,
) -> ServiceSpec {
    if sizing.replicas > 1 {
        warn!(
            environment = %env.name,
            configured = sizing.replicas,
            "scheduler replicas clamped to 1"
        );
    }

    ServiceSpec {
        id: ServiceId::new(env.name, ServiceKind::Scheduler),
        image: env.images.app.clone(),
        replicas: 1,
        command: vec![
            "celery".to_string(),
            "-A".to_string(),
            env.app_module.clone(),
            "beat".to_string(),
            "-l".to_string(),
            "info".to_string(),
        ],
        env: shared.clone(),
        resources: ResourceLimits {
            memory_mb: sizing.memory_mb,
        },
        health: health(&["CMD-SHELL", "pgrep -f 'celery.*beat' || exit 1"], 10),
        depends_on: vec![],
        exposes_traffic: false,
        container_port: None,
        queue: None,
        concurrency: None,
        secrets: env.secrets.clone(),
    }
}

fn monitor_spec(
    env: &Environment,
    sizing: &ServiceSizing,
    shared: &BTreeMap<String, String>,
) -> ServiceSpec {
    let mut vars = BTreeMap::new();
    if let Some(broker) = shared.get("BROKER_URL") {
        vars.insert("CELERY_BROKER_URL".to_string(), broker.clone());
    }
    vars.insert("FLOWER_PORT".to_string(), MONITOR_PORT.to_string());
    let probe = format!("wget -qO- http://localhost:{MONITOR_PORT}/healthcheck || exit 1");

    ServiceSpec {
        id: ServiceId::new(env.name, ServiceKind::Monitor),
        image: env.images.monitor.clone(),
        replicas: sizing.replicas,
        command: vec![],
        env: vars,
        resources: ResourceLimits {
            memory_mb: sizing.memory_mb,
        },
        health: health(&["CMD-SHELL", &probe], 10),
        depends_on: vec![],
        exposes_traffic: false,
        container_port: Some(MONITOR_PORT),
        queue: None,
        concurrency: None,
        secrets: None,
    }
}
