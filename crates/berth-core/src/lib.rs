//! berth-core — declarative topology for a two-environment host.
//!
//! Parses `berth.toml` into a [`RawConfig`] and resolves it into a
//! validated [`Topology`]. Resolution is pure: no I/O beyond reading the
//! file, no side effects, and it either returns a complete topology or
//! the first violated invariant as a [`ConfigError`].

pub mod config;
pub mod error;
pub mod resolver;
pub mod topology;

pub use config::RawConfig;
pub use error::{ConfigError, ConfigResult};
pub use resolver::resolve;
pub use topology::*;
