//! berth certificate lifecycle — issuance, renewal, scheduled passes.
//!
//! A pass walks every domain of every enabled SSL environment, issues or
//! renews what is missing or close to expiry, and reloads the proxy once
//! if anything changed. Failures never touch the material being served.
//!
//! # Components
//!
//! - **`authority`** — `CertificateAuthority` trait and the certbot implementation
//! - **`manager`** — `CertificateManager`: passes, the timer loop, startup restore

pub mod authority;
pub mod error;
pub mod manager;

pub use authority::{CertbotAuthority, CertificateAuthority, IssuedCertificate, RenewalError, RenewalErrorKind};
pub use error::{CertError, CertResult};
pub use manager::{CertConfig, CertificateManager, CertificateRecords, PassReport};
