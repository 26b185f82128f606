//! Proxy error types.

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors from rendering or activating proxy configuration. Every variant
/// leaves the previously active configuration in charge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("proxy rejected the new configuration: {0}")]
    ReloadRejected(String),

    #[error("proxy unreachable: {0}")]
    Unreachable(String),

    #[error("proxy configuration io: {0}")]
    Io(String),
}
