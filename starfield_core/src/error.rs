//! Error types for the sync core.

use starfield_env::EnvError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the sync core.
///
/// Transport and post-write check failures are absorbed inside the core and
/// never reach callers as `SyncError`; durable writes and configuration
/// problems do.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown object: {0}")]
    UnknownObject(Uuid),

    #[error("Session is not running")]
    SessionClosed,
}

impl SyncError {
    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{}: {}", context, err))
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}
