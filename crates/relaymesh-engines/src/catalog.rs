//! Static engine catalog
//!
//! Lists every engine class relaymesh can orchestrate, the transports each one
//! accepts and its structural role. The camouflage engine (`trusttunnel`) is the
//! always-on secondary channel; every other engine is an opportunistic backup
//! that draws its port from the dynamic range.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Engine class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Ssh,
    Frp,
    Gost,
    Chisel,
    TrustTunnel,
}

impl EngineKind {
    pub const ALL: [EngineKind; 5] = [
        EngineKind::Ssh,
        EngineKind::Frp,
        EngineKind::Gost,
        EngineKind::Chisel,
        EngineKind::TrustTunnel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Ssh => "ssh",
            EngineKind::Frp => "frp",
            EngineKind::Gost => "gost",
            EngineKind::Chisel => "chisel",
            EngineKind::TrustTunnel => "trusttunnel",
        }
    }

    /// Catalog entry for this engine
    pub fn entry(&self) -> &'static EngineCatalogEntry {
        CATALOG
            .iter()
            .find(|entry| entry.kind == *self)
            .unwrap_or(&CATALOG[0])
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        EngineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| EngineError::UnknownEngine(s.to_string()))
    }
}

/// Structural role of an engine class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRole {
    /// Always-on camouflage channel on a fixed port
    Secondary,
    /// Opportunistic channel on a dynamic port
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineCatalogEntry {
    pub kind: EngineKind,
    pub name: &'static str,
    /// Accepted transports; the first one is the default
    pub transports: &'static [&'static str],
    pub encryption: &'static str,
    pub role: EngineRole,
    /// Lower is preferred when listing channels
    pub fallback_priority: u8,
}

impl EngineCatalogEntry {
    pub fn supports(&self, transport: &str) -> bool {
        self.transports
            .iter()
            .any(|t| t.eq_ignore_ascii_case(transport))
    }

    pub fn default_transport(&self) -> &'static str {
        self.transports[0]
    }
}

pub const CATALOG: [EngineCatalogEntry; 5] = [
    EngineCatalogEntry {
        kind: EngineKind::Ssh,
        name: "ssh",
        transports: &["tcp", "reverse"],
        encryption: "ssh-aes256-gcm",
        role: EngineRole::Backup,
        fallback_priority: 5,
    },
    EngineCatalogEntry {
        kind: EngineKind::Frp,
        name: "frp",
        transports: &["tcp", "kcp", "quic", "websocket", "wss"],
        encryption: "tls",
        role: EngineRole::Backup,
        fallback_priority: 3,
    },
    EngineCatalogEntry {
        kind: EngineKind::Gost,
        name: "gost",
        transports: &["tls", "ws", "wss", "kcp", "quic", "grpc", "h2", "mtls"],
        encryption: "tls",
        role: EngineRole::Backup,
        fallback_priority: 2,
    },
    EngineCatalogEntry {
        kind: EngineKind::Chisel,
        name: "chisel",
        transports: &["websocket", "wss"],
        encryption: "ssh-over-websocket",
        role: EngineRole::Backup,
        fallback_priority: 4,
    },
    EngineCatalogEntry {
        kind: EngineKind::TrustTunnel,
        name: "trusttunnel",
        transports: &["http3", "h2"],
        encryption: "tls1.3",
        role: EngineRole::Secondary,
        fallback_priority: 1,
    },
];

/// Look up a catalog entry by engine name (case-insensitive)
pub fn lookup(name: &str) -> Option<&'static EngineCatalogEntry> {
    CATALOG.iter().find(|entry| entry.name.eq_ignore_ascii_case(name.trim()))
}

/// Always-on service bound to a fixed port outside the dynamic range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FixedPortService {
    pub name: &'static str,
    pub port: u16,
    pub engine: Option<EngineKind>,
}

pub const FIXED_PORT_SERVICES: [FixedPortService; 2] = [
    FixedPortService {
        name: "trusttunnel",
        port: 443,
        engine: Some(EngineKind::TrustTunnel),
    },
    FixedPortService {
        name: "decoy-web",
        port: 80,
        engine: None,
    },
];

/// Ports held by fixed services; never handed out for dynamic tunnels
pub const RESERVED_PORTS: [u16; 2] = [80, 443];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_names() {
        assert_eq!("gost".parse::<EngineKind>().unwrap(), EngineKind::Gost);
        assert_eq!(" TrustTunnel ".parse::<EngineKind>().unwrap(), EngineKind::TrustTunnel);
        assert!(matches!(
            "wireguard".parse::<EngineKind>(),
            Err(EngineError::UnknownEngine(name)) if name == "wireguard"
        ));
    }

    #[test]
    fn test_every_kind_has_an_entry() {
        for kind in EngineKind::ALL {
            assert_eq!(kind.entry().kind, kind);
            assert_eq!(lookup(kind.as_str()).map(|e| e.kind), Some(kind));
        }
    }

    #[test]
    fn test_single_secondary_channel() {
        let secondaries: Vec<_> = CATALOG
            .iter()
            .filter(|e| e.role == EngineRole::Secondary)
            .collect();
        assert_eq!(secondaries.len(), 1);
        assert_eq!(secondaries[0].kind, EngineKind::TrustTunnel);
    }

    #[test]
    fn test_transport_support() {
        let gost = EngineKind::Gost.entry();
        assert!(gost.supports("TLS"));
        assert!(!gost.supports("reverse"));
        assert_eq!(gost.default_transport(), "tls");
    }

    #[test]
    fn test_reserved_ports_match_fixed_services() {
        for service in FIXED_PORT_SERVICES {
            assert!(RESERVED_PORTS.contains(&service.port));
        }
    }
}
