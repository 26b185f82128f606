//! CertificateManager — issuance and renewal passes over served domains.
//!
//! A pass attempts every SSL domain of every enabled environment that has
//! no material yet or expires within the renewal threshold. Each attempt
//! is recorded. Material obtained during the pass is published to the
//! proxy's TLS store, followed by exactly one proxy reload. A failed
//! attempt leaves the previously served material untouched. The reload
//! also happens when a records failure cuts the pass short.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use berth_core::Topology;
use berth_proxy::{ProxyRouter, TlsMaterial};
use berth_state::{CertificateRecord, RenewalOutcome, StateResult, StateStore};

use crate::authority::{CertificateAuthority, IssuedCertificate, RenewalError, RenewalErrorKind};
use crate::error::CertResult;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct CertConfig {
    /// Renew when the certificate expires within this many days.
    pub renew_before_days: u64,
    /// Seconds between scheduled passes.
    pub interval_secs: u64,
    /// Longest a single issue or renew call may take.
    pub authority_timeout_secs: u64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            renew_before_days: 30,
            interval_secs: 12 * 60 * 60,
            authority_timeout_secs: 5 * 60,
        }
    }
}

impl CertConfig {
    pub fn renew_before_secs(&self) -> u64 {
        self.renew_before_days * DAY_SECS
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn authority_timeout(&self) -> Duration {
        Duration::from_secs(self.authority_timeout_secs.max(1))
    }
}

/// Where certificate records live.
pub trait CertificateRecords: Send + Sync {
    fn get(&self, domain: &str) -> StateResult<Option<CertificateRecord>>;
    fn put(&self, record: &CertificateRecord) -> StateResult<()>;
    fn list(&self) -> StateResult<Vec<CertificateRecord>>;
}

impl CertificateRecords for StateStore {
    fn get(&self, domain: &str) -> StateResult<Option<CertificateRecord>> {
        self.get_certificate(domain)
    }

    fn put(&self, record: &CertificateRecord) -> StateResult<()> {
        self.put_certificate(record)
    }

    fn list(&self) -> StateResult<Vec<CertificateRecord>> {
        self.list_certificates()
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub issued: Vec<String>,
    pub renewed: Vec<String>,
    /// Domains whose material is valid beyond the threshold.
    pub skipped: Vec<String>,
    pub failed: Vec<RenewalError>,
    /// Whether the proxy was reloaded after the pass.
    pub reloaded: bool,
    pub reload_error: Option<String>,
}

impl PassReport {
    pub fn attempted(&self) -> usize {
        self.issued.len() + self.renewed.len() + self.failed.len()
    }

    pub fn any_success(&self) -> bool {
        !self.issued.is_empty() || !self.renewed.is_empty()
    }
}

enum Attempt {
    Issue,
    Renew,
}

pub struct CertificateManager {
    authority: Arc<dyn CertificateAuthority>,
    records: Arc<dyn CertificateRecords>,
    router: Arc<ProxyRouter>,
    config: CertConfig,
    /// Held for the duration of a pass.
    pass_lock: Mutex<()>,
}

impl CertificateManager {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        records: impl CertificateRecords + 'static,
        router: Arc<ProxyRouter>,
        config: CertConfig,
    ) -> Self {
        Self {
            authority,
            records: Arc::new(records),
            router,
            config,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CertConfig {
        &self.config
    }

    pub fn records(&self) -> CertResult<Vec<CertificateRecord>> {
        Ok(self.records.list()?)
    }

    /// Publish previously obtained material to the proxy. Called once at
    /// startup so a restart serves HTTPS before the first pass.
    pub fn restore_material(&self) -> CertResult<usize> {
        let mut restored = 0;
        for record in self.records.list()? {
            if let Some(material) = material_of(&record) {
                self.router.tls().upsert(material);
                restored += 1;
            }
        }
        debug!(restored, "tls material restored from records");
        Ok(restored)
    }

    pub async fn run_pass(&self, topology: &Topology) -> CertResult<PassReport> {
        self.run_pass_at(topology, epoch_secs()).await
    }

    /// Run a pass as if the clock read `now` (Unix seconds).
    ///
    /// A records failure stops the pass. Material obtained before it is
    /// still published and reloaded, then the failure is returned.
    pub async fn run_pass_at(&self, topology: &Topology, now: u64) -> CertResult<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let mut report = PassReport::default();

        let attempted = self.attempt_domains(topology, now, &mut report).await;

        if report.any_success() {
            match self.router.reload().await {
                Ok(()) => report.reloaded = true,
                Err(e) => {
                    error!(error = %e, "proxy reload after certificate pass failed");
                    report.reload_error = Some(e.to_string());
                }
            }
        }

        if let Err(e) = attempted {
            error!(
                error = %e,
                issued = report.issued.len(),
                renewed = report.renewed.len(),
                reloaded = report.reloaded,
                "certificate pass stopped"
            );
            return Err(e);
        }

        info!(
            issued = report.issued.len(),
            renewed = report.renewed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            reloaded = report.reloaded,
            "certificate pass complete"
        );
        Ok(report)
    }

    async fn attempt_domains(
        &self,
        topology: &Topology,
        now: u64,
        report: &mut PassReport,
    ) -> CertResult<()> {
        for domain in ssl_domains(topology) {
            let record = self.records.get(&domain)?;
            let attempt = match &record {
                Some(r) if r.has_material() => {
                    let expires_at = r.expires_at.unwrap_or_default();
                    if expires_at > now + self.config.renew_before_secs() {
                        debug!(%domain, expires_at, "certificate valid, skipping");
                        report.skipped.push(domain);
                        continue;
                    }
                    Attempt::Renew
                }
                _ => Attempt::Issue,
            };

            let mut record = record.unwrap_or_else(|| CertificateRecord::new(domain.clone()));
            let result = self.ask_authority(&domain, &attempt).await;
            record.last_attempt_at = Some(now);

            match result {
                Ok(issued) => {
                    apply_issued(&mut record, &issued);
                    record.last_result = Some(match attempt {
                        Attempt::Issue => RenewalOutcome::Issued,
                        Attempt::Renew => RenewalOutcome::Renewed,
                    });
                    if let Some(material) = material_of(&record) {
                        self.router.tls().upsert(material);
                    }
                    match attempt {
                        Attempt::Issue => {
                            info!(%domain, expires_at = issued.expires_at, "certificate issued");
                            report.issued.push(domain);
                        }
                        Attempt::Renew => {
                            info!(%domain, expires_at = issued.expires_at, "certificate renewed");
                            report.renewed.push(domain);
                        }
                    }
                    self.records.put(&record)?;
                }
                Err(e) => {
                    warn!(%domain, kind = %e.kind, reason = %e.reason, "certificate attempt failed");
                    record.last_result = Some(RenewalOutcome::Failed {
                        kind: e.kind.to_string(),
                        reason: e.reason.clone(),
                    });
                    report.failed.push(e);
                    self.records.put(&record)?;
                }
            }
        }
        Ok(())
    }

    /// One authority call, bounded by `authority_timeout_secs`.
    async fn ask_authority(
        &self,
        domain: &str,
        attempt: &Attempt,
    ) -> Result<IssuedCertificate, RenewalError> {
        let call = match attempt {
            Attempt::Issue => self.authority.issue(domain),
            Attempt::Renew => self.authority.renew(domain),
        };
        let limit = self.config.authority_timeout();
        tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(RenewalError::new(
                domain,
                RenewalErrorKind::Network,
                format!("no answer from the authority within {}s", limit.as_secs()),
            ))
        })
    }

    /// Run a pass now and then every `interval_secs` until `shutdown`
    /// flips. The topology is re-read before each pass.
    pub async fn run(
        &self,
        topology: watch::Receiver<Arc<Topology>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(interval_secs = self.config.interval_secs, "certificate loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = Arc::clone(&topology.borrow());
                    if let Err(e) = self.run_pass(&current).await {
                        error!(error = %e, "certificate pass aborted");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("certificate loop shutting down");
                    break;
                }
            }
        }
    }
}

/// SSL domains of enabled environments, sorted and de-duplicated.
fn ssl_domains(topology: &Topology) -> BTreeSet<String> {
    topology
        .enabled_environments()
        .filter(|env| env.ssl)
        .flat_map(|env| env.domains().map(str::to_string))
        .collect()
}

fn apply_issued(record: &mut CertificateRecord, issued: &IssuedCertificate) {
    record.expires_at = Some(issued.expires_at);
    record.cert_path = Some(issued.cert_path.clone());
    record.key_path = Some(issued.key_path.clone());
}

fn material_of(record: &CertificateRecord) -> Option<TlsMaterial> {
    Some(TlsMaterial {
        domain: record.domain.clone(),
        cert_path: record.cert_path.clone()?,
        key_path: record.key_path.clone()?,
        expires_at: record.expires_at?,
    })
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
