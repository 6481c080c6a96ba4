//! Control-plane errors

use relaymesh_engines::EngineError;
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid port {0}")]
    InvalidPort(u32),

    #[error("Port {0} is already assigned")]
    PortInUse(u16),

    #[error("Port {port} is held by active tunnel {tunnel_id}")]
    PortConflict { port: u16, tunnel_id: i32 },

    #[error("Port {0} is reserved for an always-on service")]
    ReservedPort(u16),

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Engine {engine} does not support transport {transport:?}")]
    UnsupportedTransport { engine: String, transport: String },

    #[error("Relay node {0} not found")]
    NodeNotFound(i32),

    #[error("Tunnel {0} not found")]
    TunnelNotFound(i32),

    #[error("Invalid tunnel config: {0}")]
    InvalidConfig(String),

    #[error("Adapter for {0} is already running")]
    AdapterAlreadyRunning(String),

    #[error("No adapter handle for {0}")]
    AdapterNotFound(String),

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailure(String),

    #[error("Process exited unexpectedly: {0}")]
    ProcessExitedUnexpectedly(String),

    #[error("Tunnel {tunnel_id} exceeded {max_retries} reconnect attempts")]
    MaxRetriesExceeded { tunnel_id: String, max_retries: u32 },

    #[error("A monitoring cycle is already in progress")]
    CycleInProgress,

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl ControlError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::InvalidPort(_) => "invalid_port",
            ControlError::PortInUse(_) => "port_in_use",
            ControlError::PortConflict { .. } => "port_conflict",
            ControlError::ReservedPort(_) => "reserved_port",
            ControlError::UnknownEngine(_) => "unknown_engine",
            ControlError::UnsupportedTransport { .. } => "unsupported_transport",
            ControlError::NodeNotFound(_) => "node_not_found",
            ControlError::TunnelNotFound(_) => "tunnel_not_found",
            ControlError::InvalidConfig(_) => "invalid_config",
            ControlError::AdapterAlreadyRunning(_) => "adapter_already_running",
            ControlError::AdapterNotFound(_) => "adapter_not_found",
            ControlError::ProcessSpawnFailure(_) => "process_spawn_failure",
            ControlError::ProcessExitedUnexpectedly(_) => "process_exited_unexpectedly",
            ControlError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            ControlError::CycleInProgress => "cycle_in_progress",
            ControlError::Database(_) => "database",
        }
    }

    /// Caller-input and validation errors; never retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ControlError::InvalidPort(_)
                | ControlError::PortInUse(_)
                | ControlError::PortConflict { .. }
                | ControlError::ReservedPort(_)
                | ControlError::UnknownEngine(_)
                | ControlError::UnsupportedTransport { .. }
                | ControlError::NodeNotFound(_)
                | ControlError::InvalidConfig(_)
        )
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<EngineError> for ControlError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownEngine(name) => ControlError::UnknownEngine(name),
            EngineError::AlreadyRunning(id) => ControlError::AdapterAlreadyRunning(id),
            EngineError::NotFound(id) => ControlError::AdapterNotFound(id),
            EngineError::InvalidOptions { .. } => ControlError::InvalidConfig(err.to_string()),
            EngineError::ConfigWrite { .. } | EngineError::SpawnFailure { .. } => {
                ControlError::ProcessSpawnFailure(err.to_string())
            }
            EngineError::ExitedUnexpectedly(description) => {
                ControlError::ProcessExitedUnexpectedly(description)
            }
            EngineError::MaxRetriesExceeded {
                tunnel_id,
                max_retries,
            } => ControlError::MaxRetriesExceeded {
                tunnel_id,
                max_retries,
            },
        }
    }
}

/// Structured error body returned to the administrative layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
}

impl From<&ControlError> for ErrorReport {
    fn from(err: &ControlError) -> Self {
        err.report()
    }
}
