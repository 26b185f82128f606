//! Topology resolution — raw configuration in, validated [`Topology`] out.
//!
//! Resolution fails closed on the first violated invariant. Environments
//! are checked in `staging`, `production` order so the reported error is
//! deterministic for a given input.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::{EnvironmentConfig, RawConfig, ServiceConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::topology::*;

/// Ports owned by the reverse proxy.
const RESERVED_PORTS: [u16; 2] = [80, 443];

const DEFAULT_QUEUE: &str = "default";
const SECONDARY_QUEUE: &str = "secondary";

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").expect("label regex"));

/// Resolve a raw configuration into a validated topology.
pub fn resolve(raw: &RawConfig) -> ConfigResult<Topology> {
    let project = raw
        .project
        .as_ref()
        .and_then(|p| p.name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(ConfigError::MissingProjectName)?
        .to_string();

    let app_module = raw
        .project
        .as_ref()
        .and_then(|p| p.app_module.clone())
        .unwrap_or_else(|| project.replace('-', "_"));

    if raw.environments.is_empty() {
        return Err(ConfigError::NoEnvironments);
    }

    let mut declared = BTreeMap::new();
    for (key, cfg) in &raw.environments {
        let name: EnvironmentName = key.parse()?;
        declared.insert(name, cfg);
    }

    let mut environments = BTreeMap::new();
    for (name, cfg) in declared {
        let env = resolve_environment(name, &project, &app_module, cfg)?;
        environments.insert(name, env);
    }

    check_unique_domains(&environments)?;
    check_distinct_ports(&environments)?;

    debug!(
        %project,
        environments = environments.len(),
        "topology resolved"
    );

    Ok(Topology {
        project,
        environments,
    })
}

fn resolve_environment(
    name: EnvironmentName,
    project: &str,
    app_module: &str,
    cfg: &EnvironmentConfig,
) -> ConfigResult<Environment> {
    let env = name.as_str();
    let missing = |field: &str| ConfigError::MissingField {
        environment: env.to_string(),
        field: field.to_string(),
    };

    let primary_domain = normalize_domain(env, cfg.domain.as_deref().ok_or_else(|| missing("domain"))?)?;
    let additional_domains = cfg
        .additional_domains
        .iter()
        .map(|d| normalize_domain(env, d))
        .collect::<ConfigResult<Vec<_>>>()?;

    let app_image = cfg
        .images
        .as_ref()
        .and_then(|i| i.app.as_deref())
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .ok_or_else(|| missing("images.app"))?;

    let port = resolve_port(env, cfg.port.ok_or_else(|| missing("port"))?)?;

    let health_path = cfg
        .health_path
        .clone()
        .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
    if !health_path.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            environment: env.to_string(),
            service: "web".to_string(),
            field: "health_path".to_string(),
            reason: "must start with '/'".to_string(),
        });
    }

    let services = resolve_selection(env, &cfg.services)?;

    let images = ImageSet {
        app: app_image.to_string(),
        cache: cfg
            .images
            .as_ref()
            .and_then(|i| i.cache.clone())
            .unwrap_or_else(|| DEFAULT_CACHE_IMAGE.to_string()),
        monitor: cfg
            .images
            .as_ref()
            .and_then(|i| i.monitor.clone())
            .unwrap_or_else(|| DEFAULT_MONITOR_IMAGE.to_string()),
    };

    Ok(Environment {
        name,
        project: project.to_string(),
        app_module: app_module.to_string(),
        enabled: cfg.enabled.unwrap_or(true),
        primary_domain,
        additional_domains,
        ssl: cfg.ssl.unwrap_or(true),
        port,
        health_path,
        images,
        services,
        secrets: cfg
            .secrets
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| SecretRef(s.to_string())),
    })
}

fn resolve_port(env: &str, port: i64) -> ConfigResult<u16> {
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ConfigError::InvalidPort {
            environment: env.to_string(),
            port,
        })?;
    if RESERVED_PORTS.contains(&port) {
        return Err(ConfigError::ReservedPort {
            environment: env.to_string(),
            port,
        });
    }
    Ok(port)
}

fn resolve_selection(
    env: &str,
    services: &crate::config::ServicesConfig,
) -> ConfigResult<ServiceSelection> {
    let web_cfg = services.web.clone().unwrap_or_default();
    let web_replicas = count(env, "web", "replicas", web_cfg.replicas, 1)?;
    if web_replicas == 0 {
        return Err(ConfigError::InvalidValue {
            environment: env.to_string(),
            service: "web".to_string(),
            field: "replicas".to_string(),
            reason: "the web tier needs at least one replica".to_string(),
        });
    }
    let web = WebSizing {
        replicas: web_replicas,
        concurrency: positive(env, "web", web_cfg.concurrency, 2)?,
        memory_mb: optional_count(env, "web", "memory_mb", web_cfg.memory_mb)?,
    };

    let cache = sizing(env, ServiceKind::Cache, services.cache.as_ref(), None)?;
    let worker_default = sizing(
        env,
        ServiceKind::WorkerDefault,
        services.worker_default.as_ref(),
        Some(DEFAULT_QUEUE),
    )?;
    let worker_secondary = sizing(
        env,
        ServiceKind::WorkerSecondary,
        services.worker_secondary.as_ref(),
        Some(SECONDARY_QUEUE),
    )?;
    let scheduler = sizing(env, ServiceKind::Scheduler, services.scheduler.as_ref(), None)?;
    let monitor = sizing(env, ServiceKind::Monitor, services.monitor.as_ref(), None)?;

    let selection = ServiceSelection {
        web,
        cache,
        worker_default,
        worker_secondary,
        scheduler,
        monitor,
    };

    // Both worker tiers share the task broker wiring of the default tier.
    if selection.is_enabled(ServiceKind::WorkerSecondary) && selection.worker_default.is_none() {
        return Err(ConfigError::UnsatisfiedDependency {
            environment: env.to_string(),
            service: ServiceKind::WorkerSecondary.to_string(),
            requires: "a worker_default section (it may be disabled)".to_string(),
        });
    }

    if let (Some(default), Some(secondary)) = (&selection.worker_default, &selection.worker_secondary)
        && default.queue == secondary.queue
    {
        return Err(ConfigError::InvalidValue {
            environment: env.to_string(),
            service: ServiceKind::WorkerSecondary.to_string(),
            field: "queue".to_string(),
            reason: "must differ from the default worker queue".to_string(),
        });
    }

    if selection.is_enabled(ServiceKind::Monitor) && selection.enabled_workers().is_empty() {
        return Err(ConfigError::UnsatisfiedDependency {
            environment: env.to_string(),
            service: ServiceKind::Monitor.to_string(),
            requires: "at least one enabled worker tier".to_string(),
        });
    }

    Ok(selection)
}

/// Resolve one optional service section. A present section defaults to
/// enabled; zero replicas always wins over the flag.
fn sizing(
    env: &str,
    kind: ServiceKind,
    cfg: Option<&ServiceConfig>,
    default_queue: Option<&str>,
) -> ConfigResult<Option<ServiceSizing>> {
    let Some(cfg) = cfg else {
        return Ok(None);
    };
    let service = kind.as_str();
    let replicas = count(env, service, "replicas", cfg.replicas, 1)?;
    let flag = cfg.enabled.unwrap_or(true);
    let enabled = flag && replicas > 0;
    if flag && !enabled {
        debug!(environment = env, service, "replicas = 0, treating service as disabled");
    }

    let concurrency = if enabled {
        positive(env, service, cfg.concurrency, 2)?
    } else {
        count(env, service, "concurrency", cfg.concurrency, 2)?
    };

    let queue = match default_queue {
        Some(default) => Some(cfg.queue.clone().unwrap_or_else(|| default.to_string())),
        None => None,
    };

    Ok(Some(ServiceSizing {
        enabled,
        replicas,
        concurrency,
        memory_mb: optional_count(env, service, "memory_mb", cfg.memory_mb)?,
        queue,
    }))
}

fn count(env: &str, service: &str, field: &str, value: Option<i64>, default: u32) -> ConfigResult<u32> {
    match value {
        None => Ok(default),
        Some(v) if v < 0 => Err(ConfigError::NegativeValue {
            environment: env.to_string(),
            service: service.to_string(),
            field: field.to_string(),
            value: v,
        }),
        Some(v) => u32::try_from(v).map_err(|_| ConfigError::InvalidValue {
            environment: env.to_string(),
            service: service.to_string(),
            field: field.to_string(),
            reason: format!("{v} is too large"),
        }),
    }
}

fn optional_count(env: &str, service: &str, field: &str, value: Option<i64>) -> ConfigResult<Option<u32>> {
    value.map(|v| count(env, service, field, Some(v), 0)).transpose()
}

fn positive(env: &str, service: &str, value: Option<i64>, default: u32) -> ConfigResult<u32> {
    let v = count(env, service, "concurrency", value, default)?;
    if v == 0 {
        return Err(ConfigError::InvalidValue {
            environment: env.to_string(),
            service: service.to_string(),
            field: "concurrency".to_string(),
            reason: "must be at least 1 for an enabled service".to_string(),
        });
    }
    Ok(v)
}

fn normalize_domain(env: &str, domain: &str) -> ConfigResult<String> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if is_valid_domain(&normalized) {
        Ok(normalized)
    } else {
        Err(ConfigError::InvalidDomain {
            environment: env.to_string(),
            domain: domain.to_string(),
        })
    }
}

/// RFC 1123 host name with at least two labels and a non-numeric TLD.
fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || !labels.iter().all(|l| LABEL.is_match(l)) {
        return false;
    }
    labels
        .last()
        .is_some_and(|tld| !tld.chars().all(|c| c.is_ascii_digit()))
}

fn check_unique_domains(environments: &BTreeMap<EnvironmentName, Environment>) -> ConfigResult<()> {
    let mut owners: BTreeMap<&str, EnvironmentName> = BTreeMap::new();
    for env in environments.values() {
        for domain in env.domains() {
            if let Some(first) = owners.insert(domain, env.name) {
                return Err(ConfigError::DuplicateDomain {
                    domain: domain.to_string(),
                    first: first.to_string(),
                    second: env.name.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_distinct_ports(environments: &BTreeMap<EnvironmentName, Environment>) -> ConfigResult<()> {
    let mut owners: BTreeMap<u16, EnvironmentName> = BTreeMap::new();
    for env in environments.values().filter(|e| e.enabled) {
        if let Some(first) = owners.insert(env.port, env.name) {
            return Err(ConfigError::PortConflict {
                port: env.port,
                first: first.to_string(),
                second: env.name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_syntax() {
        assert!(is_valid_domain("app.example.com"));
        assert!(is_valid_domain("a-b.example.co"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("bad-.example.com"));
        assert!(!is_valid_domain("under_score.example.com"));
        assert!(!is_valid_domain("10.0.0.1"));
        assert!(!is_valid_domain("a..example.com"));
    }

    #[test]
    fn domains_are_normalized() {
        assert_eq!(
            normalize_domain("production", " App.Example.COM. ").unwrap(),
            "app.example.com"
        );
    }

    #[test]
    fn ports_are_checked() {
        assert_eq!(resolve_port("staging", 8002).unwrap(), 8002);
        assert!(matches!(
            resolve_port("staging", 443),
            Err(ConfigError::ReservedPort { port: 443, .. })
        ));
        assert!(matches!(
            resolve_port("staging", 0),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            resolve_port("staging", 70_000),
            Err(ConfigError::InvalidPort { .. })
        ));
    }

    #[test]
    fn zero_replicas_disables_service() {
        let cfg = ServiceConfig {
            enabled: Some(true),
            replicas: Some(0),
            ..Default::default()
        };
        let sizing = sizing("staging", ServiceKind::Scheduler, Some(&cfg), None)
            .unwrap()
            .unwrap();
        assert!(!sizing.enabled);
        assert!(!sizing.is_active());
    }
}
