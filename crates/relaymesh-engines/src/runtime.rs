//! Runtime state machine for supervised engine processes
//!
//! ```text
//! connecting -> connected -> {error, disconnected, auth_failed}
//!      ^                              |
//!      |                         (process exit)
//!      +------ reconnecting <---------+----> failed (retries exhausted)
//!
//! any non-terminal state -> stopping (operator stop)
//! ```

use crate::catalog::EngineKind;
use crate::options::EngineMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Connecting,
    Connected,
    AuthFailed,
    Error,
    Disconnected,
    Reconnecting,
    Stopping,
    Failed,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Connecting => "connecting",
            EngineStatus::Connected => "connected",
            EngineStatus::AuthFailed => "auth_failed",
            EngineStatus::Error => "error",
            EngineStatus::Disconnected => "disconnected",
            EngineStatus::Reconnecting => "reconnecting",
            EngineStatus::Stopping => "stopping",
            EngineStatus::Failed => "failed",
        }
    }

    /// No further transitions happen from these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineStatus::Stopping | EngineStatus::Failed)
    }

    /// Next state after `event`
    pub fn on_event(self, event: &RuntimeEvent) -> EngineStatus {
        if self.is_terminal() {
            return self;
        }

        match event {
            RuntimeEvent::Output(LineSignal::Connected) => match self {
                EngineStatus::AuthFailed => self,
                _ => EngineStatus::Connected,
            },
            RuntimeEvent::Output(LineSignal::AuthFailed(_)) => EngineStatus::AuthFailed,
            RuntimeEvent::Output(LineSignal::Error(_)) => EngineStatus::Error,
            RuntimeEvent::Output(LineSignal::Disconnected(_)) => EngineStatus::Disconnected,
            RuntimeEvent::Settled => match self {
                EngineStatus::Connecting => EngineStatus::Connected,
                _ => self,
            },
            RuntimeEvent::Spawned { .. } => EngineStatus::Connecting,
            RuntimeEvent::Exited { .. } => EngineStatus::Disconnected,
            RuntimeEvent::SpawnFailed(_) => EngineStatus::Error,
            RuntimeEvent::RetryScheduled { .. } => EngineStatus::Reconnecting,
            RuntimeEvent::RetriesExhausted => EngineStatus::Failed,
            RuntimeEvent::StopRequested => EngineStatus::Stopping,
        }
    }
}

/// Classification of one output line from an engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    Connected,
    AuthFailed(String),
    Error(String),
    Disconnected(String),
}

impl LineSignal {
    pub fn error_text(&self) -> Option<&str> {
        match self {
            LineSignal::Connected => None,
            LineSignal::AuthFailed(line)
            | LineSignal::Error(line)
            | LineSignal::Disconnected(line) => Some(line),
        }
    }
}

/// Events fed to the state machine by the supervision task
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Spawned { pid: Option<u32> },
    Output(LineSignal),
    /// Settle delay elapsed with the process still alive
    Settled,
    Exited { description: String },
    SpawnFailed(String),
    RetryScheduled { attempt: u32 },
    RetriesExhausted,
    StopRequested,
}

/// Observable state of one supervised tunnel process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub tunnel_id: String,
    pub engine: EngineKind,
    pub mode: EngineMode,
    pub pid: Option<u32>,
    pub status: EngineStatus,
    /// Reconnect attempts consumed so far
    pub retries: u32,
    /// Total process launches, including the first
    pub spawn_count: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
}

impl RuntimeState {
    pub fn new(tunnel_id: impl Into<String>, engine: EngineKind, mode: EngineMode) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            engine,
            mode,
            pid: None,
            status: EngineStatus::Connecting,
            retries: 0,
            spawn_count: 0,
            last_error: None,
            started_at: Utc::now(),
            connected_at: None,
            rx_bytes: None,
            tx_bytes: None,
        }
    }

    /// Apply an event, updating status and bookkeeping fields
    pub fn apply(&mut self, event: &RuntimeEvent) {
        let previous = self.status;
        self.status = previous.on_event(event);

        match event {
            RuntimeEvent::Spawned { pid } if !previous.is_terminal() => {
                self.pid = *pid;
                self.spawn_count += 1;
                self.connected_at = None;
            }
            RuntimeEvent::Output(signal) if !previous.is_terminal() => {
                if let Some(text) = signal.error_text() {
                    self.last_error = Some(text.to_string());
                }
            }
            RuntimeEvent::Exited { description } => {
                self.pid = None;
                self.connected_at = None;
                if !previous.is_terminal() {
                    self.last_error = Some(description.clone());
                }
            }
            RuntimeEvent::SpawnFailed(reason) => {
                self.pid = None;
                self.last_error = Some(reason.clone());
            }
            RuntimeEvent::RetryScheduled { attempt } if !previous.is_terminal() => {
                self.retries = *attempt;
            }
            _ => {}
        }

        if self.status == EngineStatus::Connected && previous != EngineStatus::Connected {
            self.connected_at = Some(Utc::now());
        }
    }

    /// Seconds since the process reached `connected`
    pub fn uptime_secs(&self) -> Option<u64> {
        self.connected_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
    }
}
