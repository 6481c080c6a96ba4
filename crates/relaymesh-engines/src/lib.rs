//! Engine adapters for relaymesh
//!
//! Each adapter translates the generic start/stop/status/health/deploy contract
//! into the command line, configuration files and process lifecycle of one
//! external tunneling program:
//!
//! - **ssh**: OpenSSH local/remote port forwarding
//! - **frp**: frpc/frps with a rendered TOML config
//! - **gost**: GOST v3 relay chains
//! - **chisel**: chisel client/server over WebSocket
//! - **trusttunnel**: HTTP/3 camouflage transport with a decoy site
//!
//! Processes are supervised by a per-tunnel task that classifies output lines,
//! drives the [`EngineStatus`] state machine and applies the bounded
//! [`ReconnectPolicy`] on unintended exits.

pub mod adapter;
pub mod catalog;
pub mod deploy;
pub mod driver;
pub mod engines;
pub mod error;
pub mod options;
pub mod policy;
pub mod runtime;
mod supervisor;

pub use adapter::{
    Adapter, EngineAdapter, EngineRegistry, HealthReport, StartOutcome, StopOutcome,
    SupervisorConfig,
};
pub use catalog::{
    EngineCatalogEntry, EngineKind, EngineRole, FixedPortService, CATALOG, FIXED_PORT_SERVICES,
    RESERVED_PORTS,
};
pub use deploy::{shell_quote, systemd_quote, DeployPlan};
pub use driver::{ConfigFile, EngineDriver, LaunchSpec};
pub use engines::{
    ChiselAdapter, ChiselDriver, FrpAdapter, FrpDriver, GostAdapter, GostDriver, SshAdapter,
    SshDriver, TrustTunnelAdapter, TrustTunnelDriver,
};
pub use error::EngineError;
pub use options::{EngineMode, StartOptions};
pub use policy::ReconnectPolicy;
pub use runtime::{EngineStatus, LineSignal, RuntimeEvent, RuntimeState};
