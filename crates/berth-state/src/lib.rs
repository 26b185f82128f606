//! berth-state — embedded state store for berth.
//!
//! Backed by [redb](https://docs.rs/redb). Holds what must survive a
//! process restart: certificate records, the spec history each rollback
//! re-applies, and the last rollout report per environment.
//!
//! Values are stored as JSON under string keys. Only one process can hold
//! the on-disk store; a second `StateStore::open` gets `StateError::Locked`.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
