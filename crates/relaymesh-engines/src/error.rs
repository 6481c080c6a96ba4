//! Engine adapter errors

use crate::catalog::EngineKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Tunnel {0} is already running")]
    AlreadyRunning(String),

    #[error("Tunnel {0} is not tracked by this adapter")]
    NotFound(String),

    #[error("Invalid {engine} options: {reason}")]
    InvalidOptions { engine: EngineKind, reason: String },

    #[error("Failed to write config file {path:?}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited unexpectedly: {0}")]
    ExitedUnexpectedly(String),

    #[error("Tunnel {tunnel_id} exceeded {max_retries} reconnect attempts")]
    MaxRetriesExceeded { tunnel_id: String, max_retries: u32 },
}

impl EngineError {
    pub(crate) fn invalid(engine: EngineKind, reason: impl Into<String>) -> Self {
        EngineError::InvalidOptions {
            engine,
            reason: reason.into(),
        }
    }
}
