//! ProxyRouter — owns the route table and drives reloads.
//!
//! Reloads are serialized: only one runs at a time. Callers arriving while
//! one is in flight queue up, and the first of them to get the slot runs a
//! single reload on behalf of all of them. Every caller receives the result
//! of a reload that started after its own request, so a successful return
//! means the state at request time is live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use berth_core::{EnvironmentName, Topology};

use crate::error::ProxyResult;
use crate::render::{RenderOptions, render_site};
use crate::routes::{Backend, ReconcileStats, RouteTable};
use crate::sink::ProxySink;
use crate::tls::TlsStore;

/// The last completed reload.
struct Completed {
    /// Highest request number this reload covered.
    covers: u64,
    result: ProxyResult<()>,
}

pub struct ProxyRouter {
    table: RwLock<RouteTable>,
    tls: Arc<TlsStore>,
    sink: Arc<dyn ProxySink>,
    options: RenderOptions,
    requested: AtomicU64,
    completed: Mutex<Completed>,
    performed: AtomicU64,
}

impl ProxyRouter {
    pub fn new(sink: Arc<dyn ProxySink>, tls: Arc<TlsStore>, options: RenderOptions) -> Self {
        Self {
            table: RwLock::new(RouteTable::new()),
            tls,
            sink,
            options,
            requested: AtomicU64::new(0),
            completed: Mutex::new(Completed {
                covers: 0,
                result: Ok(()),
            }),
            performed: AtomicU64::new(0),
        }
    }

    pub fn tls(&self) -> &Arc<TlsStore> {
        &self.tls
    }

    /// Rebuild routes from `topology`. Takes effect on the next reload.
    pub fn reconcile_routes(&self, topology: &Topology) -> ReconcileStats {
        let stats = self.table.write().expect("route table lock").reconcile(topology);
        info!(
            routes = stats.routes,
            added = stats.added,
            removed = stats.removed,
            "routes reconciled"
        );
        stats
    }

    /// Publish the live web instances of `env`. Takes effect on the next
    /// reload.
    pub fn set_backends(&self, env: EnvironmentName, backends: Vec<Backend>) {
        let healthy = backends.iter().filter(|b| b.healthy).count();
        let known = self
            .table
            .write()
            .expect("route table lock")
            .set_backends(env, backends);
        if known {
            debug!(environment = %env, healthy, "backends published");
        } else {
            warn!(environment = %env, "backends published for an environment without routes");
        }
    }

    /// Render the site for the current state without activating it.
    pub fn render(&self) -> String {
        let table = self.table.read().expect("route table lock");
        render_site(&table, &self.tls, &self.options)
    }

    /// Number of reloads actually handed to the sink.
    pub fn reloads_performed(&self) -> u64 {
        self.performed.load(Ordering::SeqCst)
    }

    /// Render and activate the current state.
    pub async fn reload(&self) -> ProxyResult<()> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut completed = self.completed.lock().await;

        if completed.covers >= ticket {
            debug!(ticket, covered_by = completed.covers, "reload coalesced");
            return completed.result.clone();
        }

        // Everything requested up to now is served by this reload.
        let covers = self.requested.load(Ordering::SeqCst);
        let site = self.render();
        let result = match self.sink.validate(&site).await {
            Ok(()) => self.sink.activate().await,
            Err(e) => Err(e),
        };
        self.performed.fetch_add(1, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(covers, "proxy reloaded"),
            Err(e) => warn!(error = %e, "proxy reload failed, previous configuration stays active"),
        }
        *completed = Completed {
            covers,
            result: result.clone(),
        };
        result
    }
}
