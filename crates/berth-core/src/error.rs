//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration resolution.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A violated configuration invariant. Always fatal and never retried;
/// the operator has to fix the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("project.name is required")]
    MissingProjectName,

    #[error("no environments declared")]
    NoEnvironments,

    #[error("unknown environment '{0}' (expected 'staging' or 'production')")]
    UnknownEnvironment(String),

    #[error("environment '{environment}': missing required field '{field}'")]
    MissingField { environment: String, field: String },

    #[error("environment '{environment}': invalid domain '{domain}'")]
    InvalidDomain { environment: String, domain: String },

    #[error("environment '{environment}': port {port} is out of range")]
    InvalidPort { environment: String, port: i64 },

    #[error("environment '{environment}': port {port} is reserved for the reverse proxy")]
    ReservedPort { environment: String, port: u16 },

    #[error("environment '{environment}': {service}.{field} must be non-negative, got {value}")]
    NegativeValue {
        environment: String,
        service: String,
        field: String,
        value: i64,
    },

    #[error("environment '{environment}': {service}.{field} is invalid: {reason}")]
    InvalidValue {
        environment: String,
        service: String,
        field: String,
        reason: String,
    },

    #[error("environment '{environment}': {service} requires {requires}")]
    UnsatisfiedDependency {
        environment: String,
        service: String,
        requires: String,
    },

    #[error("domain '{domain}' is declared by both '{first}' and '{second}'")]
    DuplicateDomain {
        domain: String,
        first: String,
        second: String,
    },

    #[error("port {port} is used by both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },
}
