//! StateStore — redb-backed state persistence for berth.
//!
//! Typed operations over certificate records, spec history and rollout
//! reports. The store supports both on-disk and in-memory backends (the
//! latter for testing and dry runs).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use berth_compose::{ServiceId, ServiceSpec};
use berth_core::EnvironmentName;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Map a redb failure onto `StateError::Storage` for `operation`.
fn storage<E: std::fmt::Display>(operation: &'static str) -> impl FnOnce(E) -> StateError {
    move |e| StateError::Storage {
        operation,
        reason: e.to_string(),
    }
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => StateError::Locked(path.to_path_buf()),
            other => StateError::Open {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open {
                path: "<memory>".into(),
                reason: e.to_string(),
            })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(storage("begin write"))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [CERTIFICATES, SPEC_HISTORY, ROLLOUTS] {
            txn.open_table(table).map_err(storage("create table"))?;
        }
        txn.commit().map_err(storage("commit"))?;
        Ok(())
    }

    // ── JSON values ────────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StateError::Encode {
            table: table.name().to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let txn = self.db.begin_write().map_err(storage("begin write"))?;
        {
            let mut open = txn.open_table(table).map_err(storage("open table"))?;
            open.insert(key, bytes.as_slice()).map_err(storage("insert"))?;
        }
        txn.commit().map_err(storage("commit"))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(storage("begin read"))?;
        let open = txn.open_table(table).map_err(storage("open table"))?;
        let Some(guard) = open.get(key).map_err(storage("get"))? else {
            return Ok(None);
        };
        decode(table, key, guard.value()).map(Some)
    }

    /// Values whose key starts with `prefix`, in key order.
    fn list_json<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(storage("begin read"))?;
        let open = txn.open_table(table).map_err(storage("open table"))?;
        let mut results = Vec::new();
        for entry in open.iter().map_err(storage("scan"))? {
            let (key, value) = entry.map_err(storage("scan"))?;
            if key.value().starts_with(prefix) {
                results.push(decode(table, key.value(), value.value())?);
            }
        }
        Ok(results)
    }

    // ── Certificates ───────────────────────────────────────────────

    /// Insert or update a certificate record.
    pub fn put_certificate(&self, record: &CertificateRecord) -> StateResult<()> {
        self.put_json(CERTIFICATES, &record.domain, record)?;
        debug!(domain = %record.domain, "certificate record stored");
        Ok(())
    }

    pub fn get_certificate(&self, domain: &str) -> StateResult<Option<CertificateRecord>> {
        self.get_json(CERTIFICATES, domain)
    }

    /// All certificate records, ordered by domain.
    pub fn list_certificates(&self) -> StateResult<Vec<CertificateRecord>> {
        self.list_json(CERTIFICATES, "")
    }

    // ── Spec history ───────────────────────────────────────────────

    /// Record `spec` as the converged state of its service and return the
    /// updated history.
    pub fn record_converged(&self, spec: &ServiceSpec) -> StateResult<SpecHistory> {
        let key = spec.id.table_key();
        let history = match self.get_json::<SpecHistory>(SPEC_HISTORY, &key)? {
            Some(existing) => existing.advance(spec.clone()),
            None => SpecHistory {
                current: spec.clone(),
                previous: None,
            },
        };
        self.put_json(SPEC_HISTORY, &key, &history)?;
        debug!(%key, revision = %spec.revision(), "spec history advanced");
        Ok(history)
    }

    pub fn get_history(&self, id: &ServiceId) -> StateResult<Option<SpecHistory>> {
        self.get_json(SPEC_HISTORY, &id.table_key())
    }

    /// Spec histories of every service of an environment.
    pub fn list_history(&self, env: EnvironmentName) -> StateResult<Vec<SpecHistory>> {
        self.list_json(SPEC_HISTORY, &format!("{env}/"))
    }

    // ── Rollout reports ────────────────────────────────────────────

    /// Replace the stored report of the latest rollout for `env`.
    pub fn put_rollout_report<R: Serialize>(
        &self,
        env: EnvironmentName,
        report: &R,
    ) -> StateResult<()> {
        self.put_json(ROLLOUTS, env.as_str(), report)
    }

    pub fn get_rollout_report<R: DeserializeOwned>(
        &self,
        env: EnvironmentName,
    ) -> StateResult<Option<R>> {
        self.get_json(ROLLOUTS, env.as_str())
    }
}

fn decode<T: DeserializeOwned>(table: Table, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Decode {
        table: table.name().to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_compose::{HealthCheck, ResourceLimits};
    use berth_core::ServiceKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn web_spec(image: &str, replicas: u32) -> ServiceSpec {
        ServiceSpec {
            id: ServiceId::new(EnvironmentName::Production, ServiceKind::Web),
            image: image.to_string(),
            replicas,
            command: vec![],
            env: BTreeMap::new(),
            resources: ResourceLimits::default(),
            health: HealthCheck {
                test: vec!["CMD".to_string(), "true".to_string()],
                interval_secs: 5,
                timeout_secs: 3,
                retries: 3,
                start_period_secs: 0,
            },
            depends_on: vec![],
            exposes_traffic: true,
            container_port: Some(8000),
            queue: None,
            concurrency: Some(2),
            secrets: None,
        }
    }

    // ── Certificates ───────────────────────────────────────────────

    #[test]
    fn certificate_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = CertificateRecord::new("app.example.com");
        record.expires_at = Some(2_000_000);
        record.cert_path = Some(PathBuf::from("/etc/letsencrypt/live/app.example.com/fullchain.pem"));
        record.key_path = Some(PathBuf::from("/etc/letsencrypt/live/app.example.com/privkey.pem"));
        record.last_attempt_at = Some(1_000);
        record.last_result = Some(RenewalOutcome::Issued);

        store.put_certificate(&record).unwrap();
        let retrieved = store.get_certificate("app.example.com").unwrap();
        assert_eq!(retrieved, Some(record));
    }

    #[test]
    fn certificate_missing_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_certificate("nope.example.com").unwrap().is_none());
    }

    #[test]
    fn failed_first_attempt_has_no_material() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = CertificateRecord::new("www.example.com");
        record.last_attempt_at = Some(1_000);
        record.last_result = Some(RenewalOutcome::Failed {
            kind: "rate_limited".to_string(),
            reason: "too many certificates".to_string(),
        });
        store.put_certificate(&record).unwrap();

        let retrieved = store.get_certificate("www.example.com").unwrap().unwrap();
        assert!(!retrieved.has_material());
        assert!(!retrieved.last_result.unwrap().is_success());
    }

    #[test]
    fn certificates_are_listed_by_domain() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_certificate(&CertificateRecord::new("www.example.com")).unwrap();
        store.put_certificate(&CertificateRecord::new("app.example.com")).unwrap();

        let domains: Vec<_> = store
            .list_certificates()
            .unwrap()
            .into_iter()
            .map(|r| r.domain)
            .collect();
        assert_eq!(domains, vec!["app.example.com", "www.example.com"]);
    }

    // ── Spec history ───────────────────────────────────────────────

    #[test]
    fn history_keeps_previous_revision() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_converged(&web_spec("shop:v1", 2)).unwrap();
        let history = store.record_converged(&web_spec("shop:v2", 2)).unwrap();

        assert_eq!(history.current.image, "shop:v2");
        assert_eq!(history.previous.unwrap().image, "shop:v1");
    }

    #[test]
    fn scaling_does_not_shift_history() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_converged(&web_spec("shop:v1", 2)).unwrap();
        store.record_converged(&web_spec("shop:v2", 2)).unwrap();
        let history = store.record_converged(&web_spec("shop:v2", 4)).unwrap();

        assert_eq!(history.current.replicas, 4);
        assert_eq!(history.previous.unwrap().image, "shop:v1");
    }

    #[test]
    fn history_listed_per_environment() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_converged(&web_spec("shop:v1", 1)).unwrap();
        let mut staging = web_spec("shop:v1", 1);
        staging.id.environment = EnvironmentName::Staging;
        store.record_converged(&staging).unwrap();

        assert_eq!(store.list_history(EnvironmentName::Production).unwrap().len(), 1);
        assert_eq!(store.list_history(EnvironmentName::Staging).unwrap().len(), 1);
    }

    // ── Rollout reports ────────────────────────────────────────────

    #[test]
    fn rollout_report_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let report = serde_json::json!({ "outcome": "success", "services": [] });
        store
            .put_rollout_report(EnvironmentName::Production, &report)
            .unwrap();

        let stored: Option<serde_json::Value> =
            store.get_rollout_report(EnvironmentName::Production).unwrap();
        assert_eq!(stored, Some(report));
        let missing: Option<serde_json::Value> =
            store.get_rollout_report(EnvironmentName::Staging).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn unreadable_value_names_its_key() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_certificate(&CertificateRecord::new("app.example.com")).unwrap();
        let err = store
            .get_json::<SpecHistory>(CERTIFICATES, "app.example.com")
            .unwrap_err();
        assert!(matches!(err, StateError::Decode { ref key, .. } if key == "app.example.com"));
        assert!(err.to_string().contains("certificates/app.example.com"));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_certificate(&CertificateRecord::new("app.example.com")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_certificate("app.example.com").unwrap().is_some());
    }

    #[test]
    fn second_open_reports_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.redb");
        let _held = StateStore::open(&path).unwrap();
        let err = StateStore::open(&path).err().unwrap();
        assert!(matches!(err, StateError::Locked(ref p) if p == &path));
    }
}
