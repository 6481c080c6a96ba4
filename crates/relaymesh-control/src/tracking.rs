//! Autopilot tracking map: which tunnel holds each assigned port

use chrono::{DateTime, Utc};
use relaymesh_engines::EngineKind;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedTunnel {
    pub tunnel_id: i32,
    pub engine: EngineKind,
    pub transport: String,
    pub registered_at: DateTime<Utc>,
}

impl TrackedTunnel {
    pub fn new(tunnel_id: i32, engine: EngineKind, transport: impl Into<String>) -> Self {
        Self {
            tunnel_id,
            engine,
            transport: transport.into(),
            registered_at: Utc::now(),
        }
    }
}

/// Port-keyed registry of tunnels the autopilot watches
#[derive(Debug, Default)]
pub struct TrackingMap {
    entries: RwLock<HashMap<u16, TrackedTunnel>>,
}

impl TrackingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel under its port, replacing any stale entry
    pub fn register(&self, port: u16, entry: TrackedTunnel) -> Option<TrackedTunnel> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let previous = entries.insert(port, entry);

        match &previous {
            Some(old) => tracing::info!(
                port,
                old_tunnel_id = old.tunnel_id,
                "Replaced tracked tunnel on port"
            ),
            None => tracing::debug!(port, "Tracking tunnel port"),
        }

        previous
    }

    pub fn unregister(&self, port: u16) -> Option<TrackedTunnel> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port)
    }

    pub fn get(&self, port: u16) -> Option<TrackedTunnel> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .cloned()
    }

    /// Whether `port` is tracked for exactly this tunnel
    pub fn tracks(&self, port: u16, tunnel_id: i32) -> bool {
        self.get(port).is_some_and(|entry| entry.tunnel_id == tunnel_id)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Entries sorted by port
    pub fn snapshot(&self) -> Vec<(u16, TrackedTunnel)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<(u16, TrackedTunnel)> = entries
            .iter()
            .map(|(port, entry)| (*port, entry.clone()))
            .collect();
        list.sort_by_key(|(port, _)| *port);
        list
    }
}
