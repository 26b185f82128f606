//! TLS material per served domain.
//!
//! The store only holds file locations; nginx reads the PEM files itself.
//! A domain without an entry has no usable certificate yet.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub domain: String,
    /// Full chain, PEM.
    pub cert_path: PathBuf,
    #[serde(skip_serializing)]
    pub key_path: PathBuf,
    /// Unix timestamp (seconds) of the certificate's notAfter.
    pub expires_at: u64,
}

#[derive(Debug, Default)]
pub struct TlsStore {
    material: RwLock<HashMap<String, TlsMaterial>>,
}

impl TlsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the material of a domain.
    pub fn upsert(&self, material: TlsMaterial) {
        let mut map = self.material.write().expect("tls lock");
        debug!(domain = %material.domain, expires_at = material.expires_at, "tls material updated");
        map.insert(material.domain.clone(), material);
    }

    pub fn remove(&self, domain: &str) -> bool {
        self.material.write().expect("tls lock").remove(domain).is_some()
    }

    pub fn get(&self, domain: &str) -> Option<TlsMaterial> {
        self.material.read().expect("tls lock").get(domain).cloned()
    }

    pub fn has_material(&self, domain: &str) -> bool {
        self.material.read().expect("tls lock").contains_key(domain)
    }

    /// Domains with material, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .material
            .read()
            .expect("tls lock")
            .keys()
            .cloned()
            .collect();
        domains.sort();
        domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(domain: &str, expires_at: u64) -> TlsMaterial {
        TlsMaterial {
            domain: domain.to_string(),
            cert_path: PathBuf::from(format!("/certs/{domain}/fullchain.pem")),
            key_path: PathBuf::from(format!("/certs/{domain}/privkey.pem")),
            expires_at,
        }
    }

    #[test]
    fn upsert_replaces() {
        let store = TlsStore::new();
        store.upsert(material("app.example.com", 100));
        store.upsert(material("app.example.com", 200));
        assert_eq!(store.get("app.example.com").unwrap().expires_at, 200);
        assert_eq!(store.domains(), vec!["app.example.com"]);
    }

    #[test]
    fn missing_domain_has_no_material() {
        let store = TlsStore::new();
        assert!(!store.has_material("app.example.com"));
        store.upsert(material("app.example.com", 100));
        assert!(store.has_material("app.example.com"));
        assert!(store.remove("app.example.com"));
        assert!(!store.has_material("app.example.com"));
    }

    #[test]
    fn key_path_is_not_serialized() {
        let json = serde_json::to_string(&material("app.example.com", 1)).unwrap();
        assert!(json.contains("fullchain.pem"));
        assert!(!json.contains("privkey.pem"));
    }
}
