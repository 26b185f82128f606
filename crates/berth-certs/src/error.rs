//! Certificate manager error types.

use thiserror::Error;

use berth_state::StateError;

pub type CertResult<T> = Result<T, CertError>;

/// Failures that abort a whole pass. Per-domain failures are
/// `RenewalError`s inside the `PassReport` instead.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate records unavailable: {0}")]
    State(#[from] StateError),
}
