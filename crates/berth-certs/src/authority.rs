//! Certificate authorities.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Why an issuance or renewal failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalErrorKind {
    RateLimited,
    DomainValidationFailed,
    Network,
    Other,
}

impl RenewalErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalErrorKind::RateLimited => "rate_limited",
            RenewalErrorKind::DomainValidationFailed => "domain_validation_failed",
            RenewalErrorKind::Network => "network",
            RenewalErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for RenewalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("certificate for {domain} failed ({kind}): {reason}")]
pub struct RenewalError {
    pub domain: String,
    pub kind: RenewalErrorKind,
    pub reason: String,
}

impl RenewalError {
    pub fn new(domain: &str, kind: RenewalErrorKind, reason: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Material produced by a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Unix timestamp (seconds) of notAfter.
    pub expires_at: u64,
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Obtain a first certificate for `domain`.
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, RenewalError>;

    /// Replace the existing certificate for `domain`.
    async fn renew(&self, domain: &str) -> Result<IssuedCertificate, RenewalError>;
}

// ── certbot ────────────────────────────────────────────────────────

/// Drives `certbot certonly --webroot` and reads expiry with `openssl`.
#[derive(Debug, Clone)]
pub struct CertbotAuthority {
    pub certbot_bin: PathBuf,
    pub openssl_bin: PathBuf,
    /// Directory nginx serves `/.well-known/acme-challenge/` from.
    pub webroot: PathBuf,
    /// certbot's `live` directory.
    pub live_dir: PathBuf,
    pub email: Option<String>,
    /// Use the ACME staging endpoint.
    pub staging: bool,
}

impl CertbotAuthority {
    pub fn new(webroot: impl Into<PathBuf>, email: Option<String>) -> Self {
        Self {
            certbot_bin: PathBuf::from("certbot"),
            openssl_bin: PathBuf::from("openssl"),
            webroot: webroot.into(),
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
            email,
            staging: false,
        }
    }

    fn certonly_args(&self, domain: &str, force: bool) -> Vec<String> {
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "-w".to_string(),
            self.webroot.display().to_string(),
            "-d".to_string(),
            domain.to_string(),
            "--cert-name".to_string(),
            domain.to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
        ];
        match &self.email {
            Some(email) => args.extend(["-m".to_string(), email.clone()]),
            None => args.push("--register-unsafely-without-email".to_string()),
        }
        if force {
            args.push("--force-renewal".to_string());
        }
        if self.staging {
            args.push("--staging".to_string());
        }
        args
    }

    async fn obtain(&self, domain: &str, force: bool) -> Result<IssuedCertificate, RenewalError> {
        let args = self.certonly_args(domain, force);
        debug!(domain, ?args, "running certbot");
        let output = Command::new(&self.certbot_bin)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RenewalError::new(
                    domain,
                    RenewalErrorKind::Other,
                    format!("cannot run {}: {e}", self.certbot_bin.display()),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = format!("{stderr}\n{stdout}");
            return Err(RenewalError::new(
                domain,
                classify_failure(&message),
                last_meaningful_line(&stderr).unwrap_or("certbot failed"),
            ));
        }

        let cert_path = self.live_dir.join(domain).join("fullchain.pem");
        let key_path = self.live_dir.join(domain).join("privkey.pem");
        let expires_at = self.read_expiry(domain, &cert_path).await?;
        info!(domain, expires_at, "certificate obtained");
        Ok(IssuedCertificate {
            cert_path,
            key_path,
            expires_at,
        })
    }

    async fn read_expiry(&self, domain: &str, cert_path: &Path) -> Result<u64, RenewalError> {
        let output = Command::new(&self.openssl_bin)
            .args(["x509", "-enddate", "-noout", "-in"])
            .arg(cert_path)
            .output()
            .await
            .map_err(|e| {
                RenewalError::new(
                    domain,
                    RenewalErrorKind::Other,
                    format!("cannot run {}: {e}", self.openssl_bin.display()),
                )
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(RenewalError::new(
                domain,
                RenewalErrorKind::Other,
                format!("cannot read {}", cert_path.display()),
            ));
        }
        parse_not_after(&stdout).ok_or_else(|| {
            RenewalError::new(
                domain,
                RenewalErrorKind::Other,
                format!("unexpected openssl output: {}", stdout.trim()),
            )
        })
    }
}

#[async_trait]
impl CertificateAuthority for CertbotAuthority {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, RenewalError> {
        self.obtain(domain, false).await
    }

    async fn renew(&self, domain: &str) -> Result<IssuedCertificate, RenewalError> {
        self.obtain(domain, true).await
    }
}

/// Sort certbot's output into a failure kind.
pub fn classify_failure(output: &str) -> RenewalErrorKind {
    let text = output.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(&["too many certificates", "too many failed authorizations", "ratelimited", "rate limit"]) {
        RenewalErrorKind::RateLimited
    } else if any(&[
        "unauthorized",
        "challenge failed",
        "some challenges have failed",
        "dns problem",
        "nxdomain",
        "invalid response from",
        "incorrect txt record",
    ]) {
        RenewalErrorKind::DomainValidationFailed
    } else if any(&[
        "connection refused",
        "connection reset",
        "timed out",
        "timeout",
        "temporary failure in name resolution",
        "network is unreachable",
        "failed to establish a new connection",
    ]) {
        RenewalErrorKind::Network
    } else {
        RenewalErrorKind::Other
    }
}

fn last_meaningful_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty() && !l.starts_with("Ask for help") && !l.starts_with("See the logfile"))
}

/// Parse `notAfter=Jan  1 00:00:00 2027 GMT` into epoch seconds.
pub fn parse_not_after(output: &str) -> Option<u64> {
    let value = output.trim().strip_prefix("notAfter=")?;
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let parsed = NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT").ok()?;
    u64::try_from(parsed.and_utc().timestamp()).ok()
}
