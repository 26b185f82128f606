//! Resolution tests over complete berth.toml documents.

use berth_core::*;

const BASE: &str = r#"
[project]
name = "shop"

[environments.production]
domain = "app.example.com"
additional_domains = ["www.example.com"]
port = 8001

[environments.production.images]
app = "registry.example.com/shop:v1"

[environments.production.services.web]
replicas = 2
concurrency = 3

[environments.production.services.cache]
enabled = true

[environments.production.services.worker_default]
replicas = 1
concurrency = 4

[environments.staging]
domain = "staging.example.com"
port = 8002

[environments.staging.images]
app = "registry.example.com/shop:v2"
"#;

fn resolve_str(toml: &str) -> Result<Topology, ConfigError> {
    resolve(&RawConfig::from_toml_str(toml)?)
}

#[test]
fn resolves_base_config() {
    let topology = resolve_str(BASE).unwrap();
    assert_eq!(topology.project, "shop");
    assert_eq!(topology.environments.len(), 2);

    let prod = topology.environment(EnvironmentName::Production).unwrap();
    assert!(prod.enabled);
    assert!(prod.ssl);
    assert_eq!(prod.app_module, "shop");
    assert_eq!(prod.services.web.replicas, 2);
    assert!(prod.services.is_enabled(ServiceKind::Cache));
    assert!(prod.services.is_enabled(ServiceKind::WorkerDefault));
    assert!(!prod.services.is_enabled(ServiceKind::Scheduler));
    assert_eq!(
        prod.services.worker_default.as_ref().unwrap().queue.as_deref(),
        Some("default")
    );
    assert_eq!(prod.images.cache, DEFAULT_CACHE_IMAGE);

    let domains: Vec<_> = prod.domains().collect();
    assert_eq!(domains, vec!["app.example.com", "www.example.com"]);
}

#[test]
fn resolve_is_idempotent() {
    let raw = RawConfig::from_toml_str(BASE).unwrap();
    let first = resolve(&raw).unwrap();
    let second = resolve(&raw).unwrap();
    assert_eq!(first, second);
}

#[test]
fn duplicate_domain_across_environments_fails() {
    let toml = BASE.replace("staging.example.com", "www.example.com");
    let err = resolve_str(&toml).unwrap_err();
    assert_eq!(
        err,
        ConfigError::DuplicateDomain {
            domain: "www.example.com".to_string(),
            first: "staging".to_string(),
            second: "production".to_string(),
        }
    );
}

#[test]
fn duplicate_domain_is_case_insensitive() {
    let toml = BASE.replace("staging.example.com", "APP.example.com");
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::DuplicateDomain { .. })
    ));
}

#[test]
fn port_conflict_between_enabled_environments_fails() {
    let toml = BASE.replace("port = 8002", "port = 8001");
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::PortConflict { port: 8001, .. })
    ));
}

#[test]
fn disabled_environment_may_share_a_port() {
    let toml = BASE
        .replace("port = 8002", "port = 8001")
        .replace(
            "[environments.staging]\n",
            "[environments.staging]\nenabled = false\n",
        );
    let topology = resolve_str(&toml).unwrap();
    assert!(!topology.environment(EnvironmentName::Staging).unwrap().enabled);
    assert_eq!(topology.served_domains().len(), 2);
}

#[test]
fn reserved_port_fails() {
    let toml = BASE.replace("port = 8002", "port = 80");
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::ReservedPort { port: 80, .. })
    ));
}

#[test]
fn negative_replicas_fail_with_the_service_named() {
    let toml = BASE.replace("replicas = 1\nconcurrency = 4", "replicas = -1\nconcurrency = 4");
    let err = resolve_str(&toml).unwrap_err();
    assert_eq!(
        err,
        ConfigError::NegativeValue {
            environment: "production".to_string(),
            service: "worker-default".to_string(),
            field: "replicas".to_string(),
            value: -1,
        }
    );
}

#[test]
fn secondary_worker_requires_default_section() {
    let toml = format!(
        "{BASE}\n[environments.staging.services.worker_secondary]\nenabled = true\n"
    );
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::UnsatisfiedDependency { ref service, .. }) if service == "worker-secondary"
    ));
}

#[test]
fn secondary_worker_accepts_disabled_default_section() {
    let toml = format!(
        "{BASE}\n[environments.staging.services.worker_default]\nenabled = false\n\
         [environments.staging.services.worker_secondary]\nenabled = true\n"
    );
    let topology = resolve_str(&toml).unwrap();
    let staging = topology.environment(EnvironmentName::Staging).unwrap();
    assert_eq!(staging.services.enabled_workers(), vec![ServiceKind::WorkerSecondary]);
}

#[test]
fn monitor_without_workers_fails() {
    let toml = format!("{BASE}\n[environments.staging.services.monitor]\nenabled = true\n");
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::UnsatisfiedDependency { ref service, .. }) if service == "monitor"
    ));
}

#[test]
fn invalid_domain_fails() {
    let toml = BASE.replace("staging.example.com", "staging_example");
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::InvalidDomain { .. })
    ));
}

#[test]
fn missing_image_fails() {
    let toml = BASE.replace("app = \"registry.example.com/shop:v2\"", "");
    assert_eq!(
        resolve_str(&toml).unwrap_err(),
        ConfigError::MissingField {
            environment: "staging".to_string(),
            field: "images.app".to_string(),
        }
    );
}

#[test]
fn unknown_environment_fails() {
    let toml = format!("{BASE}\n[environments.qa]\ndomain = \"qa.example.com\"\n");
    assert!(matches!(
        resolve_str(&toml),
        Err(ConfigError::UnknownEnvironment(ref name)) if name == "qa"
    ));
}
