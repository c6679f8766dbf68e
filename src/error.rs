//! Error types for provisioning, configuration and worker supervision.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::WorkerExit;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Coarse classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Archive,
    Configuration,
    Launch,
    ProcessCrash,
    Timeout,
    SessionBusy,
    Cancelled,
    Io,
}

/// Errors raised while preparing or running a mining session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Artifact download failed (connection, non-2xx, truncated body).
    #[error("download failed: {0}")]
    Network(String),

    /// Downloaded archive is corrupt or of an unsupported format.
    #[error("archive error: {0}")]
    Archive(String),

    /// A required profile field is missing or still a placeholder.
    #[error("configuration error in '{field}': {message}")]
    Configuration { field: String, message: String },

    /// Worker executable is missing or could not be spawned.
    #[error("failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Worker exited while it was expected to be running.
    #[error("worker crashed with {0}")]
    ProcessCrash(WorkerExit),

    /// Provisioning or graceful stop exceeded its bound.
    #[error("{0} timed out")]
    Timeout(String),

    /// Another session already holds this backend's install path.
    #[error("another session is already running in {}", path.display())]
    SessionBusy { path: PathBuf },

    /// Operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem error.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Creates a configuration error for the given field.
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Wraps an IO error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Network(_) => ErrorKind::Network,
            SessionError::Archive(_) => ErrorKind::Archive,
            SessionError::Configuration { .. } => ErrorKind::Configuration,
            SessionError::Launch { .. } => ErrorKind::Launch,
            SessionError::ProcessCrash(_) => ErrorKind::ProcessCrash,
            SessionError::Timeout(_) => ErrorKind::Timeout,
            SessionError::SessionBusy { .. } => ErrorKind::SessionBusy,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::Io { .. } => ErrorKind::Io,
        }
    }
}
