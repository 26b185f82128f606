//! Persisted types for the berth state store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use berth_compose::{ServiceId, ServiceSpec};

// ── Certificates ───────────────────────────────────────────────────

/// Result of the most recent issuance or renewal attempt for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RenewalOutcome {
    Issued,
    Renewed,
    Failed { kind: String, reason: String },
}

impl RenewalOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RenewalOutcome::Failed { .. })
    }
}

/// Certificate bookkeeping for one served domain.
///
/// A record exists as soon as the first attempt is made, even a failed
/// one; `expires_at` stays `None` until material has been obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domain: String,
    /// Unix timestamp (seconds) of the certificate's notAfter.
    pub expires_at: Option<u64>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Unix timestamp (seconds) of the last issuance/renewal attempt.
    pub last_attempt_at: Option<u64>,
    pub last_result: Option<RenewalOutcome>,
}

impl CertificateRecord {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            expires_at: None,
            cert_path: None,
            key_path: None,
            last_attempt_at: None,
            last_result: None,
        }
    }

    /// Whether usable material has ever been obtained.
    pub fn has_material(&self) -> bool {
        self.expires_at.is_some() && self.cert_path.is_some() && self.key_path.is_some()
    }
}

// ── Spec history ───────────────────────────────────────────────────

/// The last two converged specs of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecHistory {
    pub current: ServiceSpec,
    pub previous: Option<ServiceSpec>,
}

impl SpecHistory {
    pub fn id(&self) -> ServiceId {
        self.current.id
    }

    /// Record `spec` as converged. A spec with the current revision only
    /// refreshes `current` (replica changes) and keeps the older entry.
    pub fn advance(self, spec: ServiceSpec) -> Self {
        if spec.revision() == self.current.revision() {
            Self {
                current: spec,
                previous: self.previous,
            }
        } else {
            Self {
                current: spec,
                previous: Some(self.current),
            }
        }
    }
}
