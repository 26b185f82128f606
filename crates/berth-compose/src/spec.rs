//! Service specs — the desired state of one service group.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use berth_core::{EnvironmentName, SecretRef, ServiceKind};

/// Identity of a service group: environment + catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub environment: EnvironmentName,
    pub kind: ServiceKind,
}

impl ServiceId {
    pub fn new(environment: EnvironmentName, kind: ServiceKind) -> Self {
        Self { environment, kind }
    }

    /// Key used by the state store, `{environment}/{service}`.
    pub fn table_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.kind)
    }
}

/// Container health check, in the shape the container engine expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe command, e.g. `["CMD", "redis-cli", "ping"]`.
    pub test: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

/// Resource limits per instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: Option<u32>,
}

/// Desired state of one service group within an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub image: String,
    pub replicas: u32,
    /// Empty means the image's default command.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    pub health: HealthCheck,
    /// Services that must be healthy before this one is touched.
    pub depends_on: Vec<ServiceId>,
    /// Whether user traffic is routed to this service.
    pub exposes_traffic: bool,
    /// Port the process listens on inside the container.
    pub container_port: Option<u16>,
    pub queue: Option<String>,
    pub concurrency: Option<u32>,
    pub secrets: Option<SecretRef>,
}

/// The per-instance fields that make up a revision. Replica count and
/// dependency edges are deliberately absent: changing them does not
/// require replacing running instances.
#[derive(Serialize)]
struct RevisionFields<'a> {
    image: &'a str,
    command: &'a [String],
    env: &'a BTreeMap<String, String>,
    resources: &'a ResourceLimits,
    health: &'a HealthCheck,
    container_port: Option<u16>,
    queue: Option<&'a str>,
    concurrency: Option<u32>,
    secrets: Option<&'a SecretRef>,
}

impl ServiceSpec {
    /// Fingerprint of everything an instance is created from.
    pub fn revision(&self) -> String {
        let fields = RevisionFields {
            image: &self.image,
            command: &self.command,
            env: &self.env,
            resources: &self.resources,
            health: &self.health,
            container_port: self.container_port,
            queue: self.queue.as_deref(),
            concurrency: self.concurrency,
            secrets: self.secrets.as_ref(),
        };
        // Serializing plain structs and BTreeMaps cannot fail.
        let bytes = serde_json::to_vec(&fields).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        hex::encode(&digest[..6])
    }
}
