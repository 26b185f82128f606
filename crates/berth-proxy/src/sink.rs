//! Proxy sinks — where a rendered site goes.
//!
//! `validate` must leave the previously active configuration in place when
//! it fails; `activate` hot-reloads the validated candidate.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};

#[async_trait]
pub trait ProxySink: Send + Sync {
    /// Stage `site` and check it. On failure the previous configuration
    /// is restored.
    async fn validate(&self, site: &str) -> ProxyResult<()>;

    /// Make the staged configuration live without dropping connections.
    async fn activate(&self) -> ProxyResult<()>;
}

// ── nginx ──────────────────────────────────────────────────────────

/// Writes the site file nginx includes and drives the nginx binary.
pub struct NginxSink {
    site_path: PathBuf,
    nginx_bin: PathBuf,
}

impl NginxSink {
    pub fn new(site_path: impl Into<PathBuf>) -> Self {
        Self {
            site_path: site_path.into(),
            nginx_bin: PathBuf::from("nginx"),
        }
    }

    pub fn with_binary(mut self, nginx_bin: impl Into<PathBuf>) -> Self {
        self.nginx_bin = nginx_bin.into();
        self
    }

    pub fn site_path(&self) -> &Path {
        &self.site_path
    }

    async fn run_nginx(&self, args: &[&str]) -> ProxyResult<std::process::Output> {
        Command::new(&self.nginx_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                ProxyError::Unreachable(format!("cannot run {}: {e}", self.nginx_bin.display()))
            })
    }

    async fn restore(&self, previous: Option<String>) -> ProxyResult<()> {
        match previous {
            Some(content) => write_atomic(&self.site_path, &content).await,
            None => match tokio::fs::remove_file(&self.site_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ProxyError::Io(format!(
                    "remove {}: {e}",
                    self.site_path.display()
                ))),
            },
        }
    }
}

#[async_trait]
impl ProxySink for NginxSink {
    async fn validate(&self, site: &str) -> ProxyResult<()> {
        let previous = match tokio::fs::read_to_string(&self.site_path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ProxyError::Io(format!(
                    "read {}: {e}",
                    self.site_path.display()
                )));
            }
        };

        write_atomic(&self.site_path, site).await?;

        let checked = match self.run_nginx(&["-t"]).await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(ProxyError::ReloadRejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Err(e) => Err(e),
        };

        if let Err(e) = checked {
            warn!(path = %self.site_path.display(), error = %e, "candidate site rejected, restoring previous");
            self.restore(previous).await?;
            return Err(e);
        }
        debug!(path = %self.site_path.display(), "candidate site validated");
        Ok(())
    }

    async fn activate(&self) -> ProxyResult<()> {
        let output = self.run_nginx(&["-s", "reload"]).await?;
        if !output.status.success() {
            return Err(ProxyError::Unreachable(format!(
                "nginx -s reload: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("nginx reloaded");
        Ok(())
    }
}

/// Write via a sibling temp file and rename, so nginx never reads a
/// half-written site.
async fn write_atomic(path: &Path, content: &str) -> ProxyResult<()> {
    let tmp = path.with_extension("berth-tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| ProxyError::Io(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ProxyError::Io(format!("rename to {}: {e}", path.display())))
}

// ── In-memory ──────────────────────────────────────────────────────

/// Sink that keeps activated sites in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    staged: Mutex<Option<String>>,
    active: Mutex<Vec<String>>,
    reject_containing: Mutex<Option<String>>,
    delay: Mutex<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any site containing `needle`.
    pub fn reject_containing(&self, needle: &str) {
        *self.reject_containing.lock().expect("sink lock") = Some(needle.to_string());
    }

    /// Make every activation take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("sink lock") = delay;
    }

    /// Every activated site, oldest first.
    pub fn activations(&self) -> Vec<String> {
        self.active.lock().expect("sink lock").clone()
    }

    pub fn active_site(&self) -> Option<String> {
        self.active.lock().expect("sink lock").last().cloned()
    }
}

#[async_trait]
impl ProxySink for MemorySink {
    async fn validate(&self, site: &str) -> ProxyResult<()> {
        let needle = self.reject_containing.lock().expect("sink lock").clone();
        if let Some(needle) = needle
            && site.contains(&needle)
        {
            return Err(ProxyError::ReloadRejected(format!("site contains {needle:?}")));
        }
        *self.staged.lock().expect("sink lock") = Some(site.to_string());
        Ok(())
    }

    async fn activate(&self) -> ProxyResult<()> {
        let delay = *self.delay.lock().expect("sink lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let staged = self.staged.lock().expect("sink lock").take();
        if let Some(site) = staged {
            self.active.lock().expect("sink lock").push(site);
        }
        Ok(())
    }
}
