//! berth-compose — turns one resolved environment into service specs.
//!
//! # Components
//!
//! - **`spec`** — `ServiceSpec`, `ServiceId`, health checks, revisions
//! - **`composer`** — `compose(environment)`, the fixed service catalogue
//! - **`graph`** — dependency layering via explicit topological sort

pub mod composer;
pub mod error;
pub mod graph;
pub mod spec;

pub use composer::{CACHE_PORT, MONITOR_PORT, WEB_CONTAINER_PORT, compose};
pub use error::{ComposeError, GraphError};
pub use graph::{dependents_of, rollout_waves};
pub use spec::{HealthCheck, ResourceLimits, ServiceId, ServiceSpec};
