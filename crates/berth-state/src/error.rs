//! Error types for the berth state store.

use std::path::PathBuf;

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state store {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    /// Another process (usually `berthd serve`) holds the store.
    #[error("state store {} is in use by another berth process", .0.display())]
    Locked(PathBuf),

    #[error("state store failure during {operation}: {reason}")]
    Storage { operation: &'static str, reason: String },

    #[error("cannot encode {table}/{key}: {reason}")]
    Encode {
        table: String,
        key: String,
        reason: String,
    },

    #[error("stored {table}/{key} is unreadable: {reason}")]
    Decode {
        table: String,
        key: String,
        reason: String,
    },
}
