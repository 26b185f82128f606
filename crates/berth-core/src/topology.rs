//! Resolved topology types.
//!
//! A [`Topology`] is only ever produced by [`crate::resolve`], so every
//! value reachable from it satisfies the configuration invariants:
//! domains are unique, enabled environments have distinct ports, and a
//! service with zero replicas is disabled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

// ── Environment names ──────────────────────────────────────────────

/// One of the two isolated environments sharing the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentName {
    Staging,
    Production,
}

impl EnvironmentName {
    pub const ALL: [EnvironmentName; 2] = [EnvironmentName::Staging, EnvironmentName::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentName::Staging => "staging",
            EnvironmentName::Production => "production",
        }
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(EnvironmentName::Staging),
            "production" => Ok(EnvironmentName::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

// ── Service catalogue ──────────────────────────────────────────────

/// The fixed catalogue of workloads an environment can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Web,
    Cache,
    WorkerDefault,
    WorkerSecondary,
    Scheduler,
    Monitor,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Web,
        ServiceKind::Cache,
        ServiceKind::WorkerDefault,
        ServiceKind::WorkerSecondary,
        ServiceKind::Scheduler,
        ServiceKind::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Web => "web",
            ServiceKind::Cache => "cache",
            ServiceKind::WorkerDefault => "worker-default",
            ServiceKind::WorkerSecondary => "worker-secondary",
            ServiceKind::Scheduler => "scheduler",
            ServiceKind::Monitor => "monitor",
        }
    }

    /// Name of the section under `[environments.<env>.services]`.
    pub fn config_key(&self) -> &'static str {
        match self {
            ServiceKind::Web => "web",
            ServiceKind::Cache => "cache",
            ServiceKind::WorkerDefault => "worker_default",
            ServiceKind::WorkerSecondary => "worker_secondary",
            ServiceKind::Scheduler => "scheduler",
            ServiceKind::Monitor => "monitor",
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, ServiceKind::WorkerDefault | ServiceKind::WorkerSecondary)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.config_key() == s)
            .ok_or_else(|| format!("unknown service '{s}'"))
    }
}

// ── Topology ───────────────────────────────────────────────────────

/// The validated deployment topology for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub project: String,
    pub environments: BTreeMap<EnvironmentName, Environment>,
}

impl Topology {
    pub fn environment(&self, name: EnvironmentName) -> Option<&Environment> {
        self.environments.get(&name)
    }

    pub fn enabled_environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values().filter(|e| e.enabled)
    }

    /// Every domain served by an enabled environment, with its owner.
    pub fn served_domains(&self) -> Vec<(String, EnvironmentName)> {
        self.enabled_environments()
            .flat_map(|env| env.domains().map(move |d| (d.to_string(), env.name)))
            .collect()
    }
}

/// Opaque reference to an already-resolved secret bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef(pub String);

/// Container images an environment deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSet {
    /// Application image shared by web, workers and scheduler.
    pub app: String,
    pub cache: String,
    pub monitor: String,
}

pub const DEFAULT_CACHE_IMAGE: &str = "redis:7-alpine";
pub const DEFAULT_MONITOR_IMAGE: &str = "mher/flower:2.0";
pub const DEFAULT_HEALTH_PATH: &str = "/healthz";

/// One isolated deployment of the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: EnvironmentName,
    pub project: String,
    pub app_module: String,
    pub enabled: bool,
    pub primary_domain: String,
    pub additional_domains: Vec<String>,
    pub ssl: bool,
    /// Host port the web tier answers on.
    pub port: u16,
    pub health_path: String,
    pub images: ImageSet,
    pub services: ServiceSelection,
    pub secrets: Option<SecretRef>,
}

impl Environment {
    /// Primary domain first, then additional domains in declared order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_domain.as_str())
            .chain(self.additional_domains.iter().map(String::as_str))
    }
}

// ── Service selection ─────────────────────────────────────────────

/// Sizing of the always-present web tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSizing {
    pub replicas: u32,
    /// Application server worker processes per instance.
    pub concurrency: u32,
    pub memory_mb: Option<u32>,
}

/// Sizing of one optional service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSizing {
    /// Effective intent: false whenever `replicas == 0`.
    pub enabled: bool,
    pub replicas: u32,
    pub concurrency: u32,
    pub memory_mb: Option<u32>,
    pub queue: Option<String>,
}

impl ServiceSizing {
    pub fn is_active(&self) -> bool {
        self.enabled && self.replicas > 0
    }
}

/// Which optional services an environment runs. `None` means the
/// section is absent from the configuration, which is different from a
/// present-but-disabled section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSelection {
    pub web: WebSizing,
    pub cache: Option<ServiceSizing>,
    pub worker_default: Option<ServiceSizing>,
    pub worker_secondary: Option<ServiceSizing>,
    pub scheduler: Option<ServiceSizing>,
    pub monitor: Option<ServiceSizing>,
}

impl ServiceSelection {
    pub fn sizing(&self, kind: ServiceKind) -> Option<&ServiceSizing> {
        match kind {
            ServiceKind::Web => None,
            ServiceKind::Cache => self.cache.as_ref(),
            ServiceKind::WorkerDefault => self.worker_default.as_ref(),
            ServiceKind::WorkerSecondary => self.worker_secondary.as_ref(),
            ServiceKind::Scheduler => self.scheduler.as_ref(),
            ServiceKind::Monitor => self.monitor.as_ref(),
        }
    }

    /// Whether `kind` will run. Web is always enabled.
    pub fn is_enabled(&self, kind: ServiceKind) -> bool {
        match kind {
            ServiceKind::Web => true,
            other => self.sizing(other).is_some_and(ServiceSizing::is_active),
        }
    }

    pub fn enabled_workers(&self) -> Vec<ServiceKind> {
        [ServiceKind::WorkerDefault, ServiceKind::WorkerSecondary]
            .into_iter()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }
}
