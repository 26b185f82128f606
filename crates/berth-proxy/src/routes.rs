//! Route table — which domain is served by which environment.
//!
//! Every domain of every enabled environment has exactly one route.
//! Upstreams are per environment: the published healthy web backends.
//! An environment without any has no upstream and its routes answer 503.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use berth_core::{EnvironmentName, Topology};

/// A web instance that can serve traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
}

impl Backend {
    /// Full address string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub environment: EnvironmentName,
    pub ssl: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Upstream {
    listen_port: u16,
    backends: Vec<Backend>,
}

/// Result of rebuilding the route table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub routes: u32,
    pub added: u32,
    pub removed: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, Route>,
    upstreams: BTreeMap<EnvironmentName, Upstream>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the routes from `topology`. Published backends of
    /// environments that stay enabled are kept.
    pub fn reconcile(&mut self, topology: &Topology) -> ReconcileStats {
        let mut routes = BTreeMap::new();
        let mut upstreams = BTreeMap::new();

        for env in topology.enabled_environments() {
            for domain in env.domains() {
                routes.insert(
                    domain.to_string(),
                    Route {
                        domain: domain.to_string(),
                        environment: env.name,
                        ssl: env.ssl,
                    },
                );
            }
            let backends = self
                .upstreams
                .remove(&env.name)
                .map(|u| u.backends)
                .unwrap_or_default();
            upstreams.insert(
                env.name,
                Upstream {
                    listen_port: env.port,
                    backends,
                },
            );
        }

        let added = routes.keys().filter(|d| !self.routes.contains_key(*d)).count() as u32;
        let removed = self.routes.keys().filter(|d| !routes.contains_key(*d)).count() as u32;
        self.routes = routes;
        self.upstreams = upstreams;

        let stats = ReconcileStats {
            routes: self.routes.len() as u32,
            added,
            removed,
        };
        debug!(?stats, "route table reconciled");
        stats
    }

    /// Publish the live web backends of `env`. Ignored for environments
    /// without routes.
    pub fn set_backends(&mut self, env: EnvironmentName, backends: Vec<Backend>) -> bool {
        match self.upstreams.get_mut(&env) {
            Some(upstream) => {
                upstream.backends = backends;
                true
            }
            None => false,
        }
    }

    pub fn route(&self, domain: &str) -> Option<&Route> {
        self.routes.get(&domain.to_ascii_lowercase())
    }

    /// Routes ordered by domain.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn environments(&self) -> impl Iterator<Item = EnvironmentName> + '_ {
        self.upstreams.keys().copied()
    }

    /// Host port the proxy listens on for `env` directly.
    pub fn listen_port(&self, env: EnvironmentName) -> Option<u16> {
        self.upstreams.get(&env).map(|u| u.listen_port)
    }

    /// Endpoints traffic for `env` goes to. Empty when no healthy backend
    /// is published.
    pub fn upstream_endpoints(&self, env: EnvironmentName) -> Vec<String> {
        self.upstreams
            .get(&env)
            .map(|upstream| {
                upstream
                    .backends
                    .iter()
                    .filter(|b| b.healthy)
                    .map(Backend::endpoint)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{RawConfig, resolve};

    fn topology(staging_enabled: bool) -> Topology {
        let toml = format!(
            r#"
[project]
name = "shop"

[environments.production]
domain = "app.example.com"
additional_domains = ["www.example.com"]
port = 8001
[environments.production.images]
app = "shop:v1"

[environments.staging]
enabled = {staging_enabled}
domain = "staging.example.com"
ssl = false
port = 8002
[environments.staging.images]
app = "shop:v2"
"#
        );
        resolve(&RawConfig::from_toml_str(&toml).unwrap()).unwrap()
    }

    fn backend(id: &str, port: u16, healthy: bool) -> Backend {
        Backend {
            instance_id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            healthy,
        }
    }

    #[test]
    fn one_route_per_domain() {
        let mut table = RouteTable::new();
        let stats = table.reconcile(&topology(true));
        assert_eq!(stats, ReconcileStats { routes: 3, added: 3, removed: 0 });
        assert_eq!(
            table.route("WWW.example.com").unwrap().environment,
            EnvironmentName::Production
        );
        assert!(!table.route("staging.example.com").unwrap().ssl);
    }

    #[test]
    fn disabled_environment_loses_its_routes() {
        let mut table = RouteTable::new();
        table.reconcile(&topology(true));
        let stats = table.reconcile(&topology(false));
        assert_eq!(stats.removed, 1);
        assert!(table.route("staging.example.com").is_none());
        assert!(!table.set_backends(EnvironmentName::Staging, vec![]));
    }

    #[test]
    fn upstream_uses_only_healthy_backends() {
        let mut table = RouteTable::new();
        table.reconcile(&topology(true));
        assert!(table.upstream_endpoints(EnvironmentName::Production).is_empty());
        assert_eq!(table.listen_port(EnvironmentName::Production), Some(8001));

        table.set_backends(
            EnvironmentName::Production,
            vec![backend("web-1", 32001, true), backend("web-2", 32002, false)],
        );
        assert_eq!(
            table.upstream_endpoints(EnvironmentName::Production),
            vec!["127.0.0.1:32001"]
        );

        table.set_backends(EnvironmentName::Production, vec![backend("web-2", 32002, false)]);
        assert!(table.upstream_endpoints(EnvironmentName::Production).is_empty());
    }

    #[test]
    fn backends_survive_reconcile() {
        let mut table = RouteTable::new();
        table.reconcile(&topology(true));
        table.set_backends(EnvironmentName::Production, vec![backend("web-1", 32001, true)]);
        table.reconcile(&topology(true));
        assert_eq!(
            table.upstream_endpoints(EnvironmentName::Production),
            vec!["127.0.0.1:32001"]
        );
    }
}
