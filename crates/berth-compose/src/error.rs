//! Composition error types.

use thiserror::Error;

/// Errors that can occur while composing an environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("environment '{0}': monitor is enabled but no worker tier is enabled")]
    MonitorWithoutWorkers(String),
}

/// Errors in the dependency graph of a spec set. These are configuration
/// errors: the graph never changes by retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("service {0} appears more than once")]
    DuplicateService(String),

    #[error("service {service} depends on {dependency}, which is not part of the set")]
    UnknownDependency { service: String, dependency: String },

    #[error("dependency cycle between: {}", .0.join(", "))]
    Cycle(Vec<String>),
}
