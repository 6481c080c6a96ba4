//! Pluggable health probes used by the autopilot

use async_trait::async_trait;
use rand::Rng;
use relaymesh_engines::EngineKind;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a single probe measures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeTarget {
    /// One probe per engine class, independent of instances
    EngineClass { engine: EngineKind },
    /// Always-on fixed-port service (trusttunnel:443, decoy-web:80)
    FixedService { name: String, port: u16 },
    /// A persisted tunnel row
    Tunnel {
        tunnel_id: i32,
        engine: EngineKind,
        host: String,
        port: u16,
    },
}

impl ProbeTarget {
    /// Engine class or service label stored with the sample
    pub fn label(&self) -> String {
        match self {
            ProbeTarget::EngineClass { engine } | ProbeTarget::Tunnel { engine, .. } => {
                engine.to_string()
            }
            ProbeTarget::FixedService { name, .. } => name.clone(),
        }
    }

    pub fn tunnel_id(&self) -> Option<i32> {
        match self {
            ProbeTarget::Tunnel { tunnel_id, .. } => Some(*tunnel_id),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::EngineClass { engine } => write!(f, "engine:{}", engine),
            ProbeTarget::FixedService { name, port } => write!(f, "service:{}:{}", name, port),
            ProbeTarget::Tunnel {
                tunnel_id,
                host,
                port,
                ..
            } => write!(f, "tunnel:{}@{}:{}", tunnel_id, host, port),
        }
    }
}

/// Monitoring-only failure; recorded as a `failed` sample, never propagated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Target unreachable: {0}")]
    Unreachable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    /// Measure round-trip latency in milliseconds
    async fn probe(&self, target: &ProbeTarget) -> Result<f64, ProbeError>;
}

/// Synthetic prober: each probe is a bounded delay with jittered latency
#[derive(Debug, Clone)]
pub struct SimulatedProber {
    /// Time each probe takes
    pub delay: Duration,
    /// Uniform noise applied to the base latency, in milliseconds
    pub jitter_ms: f64,
    /// Probability in [0, 1] that a probe errors
    pub failure_rate: f64,
}

impl Default for SimulatedProber {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(200),
            jitter_ms: 8.0,
            failure_rate: 0.0,
        }
    }
}

impl SimulatedProber {
    /// Base latency per engine class; lighter transports answer faster
    fn base_latency(target: &ProbeTarget) -> f64 {
        match target {
            ProbeTarget::EngineClass { engine } | ProbeTarget::Tunnel { engine, .. } => {
                match engine {
                    EngineKind::TrustTunnel => 35.0,
                    EngineKind::Gost => 45.0,
                    EngineKind::Frp => 50.0,
                    EngineKind::Chisel => 60.0,
                    EngineKind::Ssh => 70.0,
                }
            }
            ProbeTarget::FixedService { .. } => 25.0,
        }
    }
}

#[async_trait]
impl Prober for SimulatedProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<f64, ProbeError> {
        let (fails, noise) = {
            let mut rng = rand::thread_rng();
            let fails = self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate.min(1.0));
            let noise = if self.jitter_ms > 0.0 {
                rng.gen_range(-self.jitter_ms..=self.jitter_ms)
            } else {
                0.0
            };
            (fails, noise)
        };

        tokio::time::sleep(self.delay).await;

        if fails {
            return Err(ProbeError::Unreachable(target.to_string()));
        }
        Ok((Self::base_latency(target) + noise).max(1.0))
    }
}
