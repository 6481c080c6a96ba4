//! Adapter start options

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which end of the tunnel this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Near side: dials the far node
    #[default]
    Client,
    /// Far side: listens on the tunnel port
    Server,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Client => "client",
            EngineMode::Server => "server",
        }
    }
}

/// Options shared by every adapter's `start` and `generate_deploy_config`
///
/// Port semantics are uniform across engines: `port` is the tunnel port the
/// server end listens on (or the forwarded listener for ssh); `local_port` is
/// the entry point a client end exposes; `target` is the `host:port` traffic is
/// delivered to on the far side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    pub mode: EngineMode,
    pub port: u16,
    pub transport: String,
    /// Far node address the client end dials
    pub remote_host: String,
    pub remote_ssh_port: u16,
    pub remote_user: Option<String>,
    pub local_port: u16,
    pub target: String,
    /// Shared secret (frp token, gost/chisel/trusttunnel credentials)
    pub token: Option<String>,
    /// Binary override; defaults to the engine's usual program name on PATH
    pub binary: Option<String>,
    /// Engine-specific option bag taken from the tunnel config blob
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl StartOptions {
    pub fn new(mode: EngineMode, port: u16, transport: impl Into<String>) -> Self {
        Self {
            mode,
            port,
            transport: transport.into(),
            remote_host: "127.0.0.1".to_string(),
            remote_ssh_port: 22,
            remote_user: None,
            local_port: port,
            target: format!("127.0.0.1:{}", port),
            token: None,
            binary: None,
            extra: Map::new(),
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_u16(&self, key: &str) -> Option<u16> {
        self.extra
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn extra_bool(&self, key: &str) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn program<'a>(&'a self, default: &'a str) -> &'a str {
        self.binary.as_deref().unwrap_or(default)
    }

    /// Split `target` into host and port
    pub fn target_parts(&self) -> Option<(&str, u16)> {
        let (host, port) = self.target.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some((host, port))
    }
}
