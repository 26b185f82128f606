//! berth.toml configuration parser.
//!
//! These types mirror the file one-to-one and carry no invariants. Every
//! field the operator may omit is an `Option`; integers are `i64` so that
//! negative counts reach the resolver and get a precise error instead of
//! a generic parse failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub project: Option<ProjectConfig>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: Option<String>,
    /// Module the task framework loads (`<app_module>.celery` style apps).
    pub app_module: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub enabled: Option<bool>,
    pub domain: Option<String>,
    #[serde(default)]
    pub additional_domains: Vec<String>,
    pub ssl: Option<bool>,
    pub port: Option<i64>,
    /// Opaque handle to an already-resolved secret bundle.
    pub secrets: Option<String>,
    pub health_path: Option<String>,
    pub images: Option<ImagesConfig>,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagesConfig {
    pub app: Option<String>,
    pub cache: Option<String>,
    pub monitor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    pub web: Option<ServiceConfig>,
    pub cache: Option<ServiceConfig>,
    pub worker_default: Option<ServiceConfig>,
    pub worker_secondary: Option<ServiceConfig>,
    pub scheduler: Option<ServiceConfig>,
    pub monitor: Option<ServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub enabled: Option<bool>,
    pub replicas: Option<i64>,
    pub concurrency: Option<i64>,
    pub memory_mb: Option<i64>,
    pub queue: Option<String>,
}

impl RawConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let raw = RawConfig::from_toml_str(
            r#"
[project]
name = "shop"

[environments.production]
domain = "app.example.com"
port = 8001

[environments.production.images]
app = "registry.example.com/shop:v1"
"#,
        )
        .unwrap();

        assert_eq!(raw.project.unwrap().name.as_deref(), Some("shop"));
        let prod = &raw.environments["production"];
        assert_eq!(prod.port, Some(8001));
        assert!(prod.services.cache.is_none());
    }

    #[test]
    fn negative_replicas_survive_parsing() {
        let raw = RawConfig::from_toml_str(
            r#"
[environments.staging.services.worker_default]
replicas = -2
"#,
        )
        .unwrap();
        let worker = raw.environments["staging"]
            .services
            .worker_default
            .as_ref()
            .unwrap();
        assert_eq!(worker.replicas, Some(-2));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RawConfig::from_toml_str(
            r#"
[environments.staging]
domian = "typo.example.com"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
