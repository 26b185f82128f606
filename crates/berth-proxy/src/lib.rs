//! berth reverse proxy — route table, nginx site rendering, serialized reloads.
//!
//! The proxy maps every domain of every enabled environment onto that
//! environment's web upstream and terminates TLS with whatever material
//! the certificate manager has produced.
//!
//! # Components
//!
//! - **`routes`** — domain → environment routes and upstream backends
//! - **`tls`** — certificate material per domain
//! - **`render`** — nginx site generation
//! - **`sink`** — `ProxySink` trait and the nginx implementation
//! - **`router`** — `ProxyRouter`: reconcile, publish backends, reload

pub mod error;
pub mod render;
pub mod router;
pub mod routes;
pub mod sink;
pub mod tls;

pub use error::{ProxyError, ProxyResult};
pub use render::{RenderOptions, render_site};
pub use router::ProxyRouter;
pub use routes::{Backend, ReconcileStats, Route, RouteTable};
pub use sink::{MemorySink, NginxSink, ProxySink};
pub use tls::{TlsMaterial, TlsStore};
