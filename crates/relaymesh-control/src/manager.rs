//! Tunnel Manager: resolves requests into a port, a registry row and a running adapter
//!
//! Ordering on create is fixed: the port is reserved in the allocator before
//! the row is inserted, and every failure path after the reservation releases
//! it again, so concurrent creations never share a port and a failed attempt
//! never strands one.

use crate::error::ControlError;
use crate::port_allocator::PortAllocator;
use crate::store::{NewTunnel, TunnelStore};
use crate::tracking::{TrackedTunnel, TrackingMap};
use relaymesh_engines::{
    DeployPlan, EngineAdapter, EngineError, EngineKind, EngineMode, EngineRegistry, EngineStatus,
    HealthReport, RuntimeState, StartOptions, RESERVED_PORTS,
};
use relaymesh_relay_db::entities::{
    relay_node,
    tunnel::{self, TunnelStatus},
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Note attached to a stop of a row without a live process
pub const NOTE_NO_ACTIVE_PROCESS: &str = "no active process found";

/// Inbound `createTunnel` request
#[derive(Debug, Clone, Default)]
pub struct CreateTunnelRequest {
    pub engine: String,
    pub near_node_id: i32,
    pub far_node_id: Option<i32>,
    /// Explicit port; drawn from the dynamic range when absent
    pub port: Option<u16>,
    /// Empty selects the engine's default transport
    pub transport: String,
    /// Engine option bag, persisted as the row's config blob
    pub config: Map<String, Value>,
}

/// Outcome of an adapter `start`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartResult {
    pub success: bool,
    pub pid: Option<u32>,
    pub status: Option<EngineStatus>,
    pub error: Option<String>,
}

impl StartResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            pid: None,
            status: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTunnelResponse {
    pub tunnel_id: i32,
    pub port: u16,
    pub start: StartResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopResult {
    pub success: bool,
    pub note: Option<String>,
}

/// A registry row joined with its live runtime state
#[derive(Debug, Clone, Serialize)]
pub struct TunnelView {
    pub record: tunnel::Model,
    pub runtime: Option<RuntimeState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelHealth {
    pub tunnel_id: i32,
    pub engine: String,
    pub port: u16,
    pub record_status: TunnelStatus,
    pub health: Option<HealthReport>,
    pub error: Option<String>,
}

/// Identifier a tunnel row is tracked under inside its adapter
pub fn runtime_id(tunnel_id: i32) -> String {
    format!("tunnel-{}", tunnel_id)
}

fn port_of(record: &tunnel::Model) -> Result<u16, ControlError> {
    u16::try_from(record.port).map_err(|_| ControlError::InvalidPort(record.port.max(0) as u32))
}

/// Orchestration façade over the allocator, registry, tracking map and adapters
#[derive(Clone)]
pub struct TunnelManager {
    store: TunnelStore,
    engines: EngineRegistry,
    allocator: Arc<PortAllocator>,
    tracking: Arc<TrackingMap>,
}

impl TunnelManager {
    pub fn new(
        store: TunnelStore,
        engines: EngineRegistry,
        allocator: Arc<PortAllocator>,
        tracking: Arc<TrackingMap>,
    ) -> Self {
        Self {
            store,
            engines,
            allocator,
            tracking,
        }
    }

    pub fn store(&self) -> &TunnelStore {
        &self.store
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    pub fn tracking(&self) -> &Arc<TrackingMap> {
        &self.tracking
    }

    fn adapter(&self, engine: &str) -> Result<(EngineKind, Arc<dyn EngineAdapter>), ControlError> {
        let kind = EngineKind::from_str(engine)
            .map_err(|_| ControlError::UnknownEngine(engine.to_string()))?;
        let adapter = self
            .engines
            .get(kind)
            .ok_or_else(|| ControlError::UnknownEngine(engine.to_string()))?;
        Ok((kind, adapter))
    }

    /// Resolve a request into port + row + running adapter
    pub async fn create_tunnel(
        &self,
        request: CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, ControlError> {
        let (kind, adapter) = self.adapter(&request.engine)?;
        let entry = kind.entry();

        let transport = match request.transport.trim() {
            "" => entry.default_transport().to_string(),
            t if entry.supports(t) => t.to_ascii_lowercase(),
            t => {
                return Err(ControlError::UnsupportedTransport {
                    engine: kind.to_string(),
                    transport: t.to_string(),
                })
            }
        };

        let near = self
            .store
            .find_node(request.near_node_id)
            .await?
            .ok_or(ControlError::NodeNotFound(request.near_node_id))?;
        let far = match request.far_node_id {
            Some(far_id) => Some(
                self.store
                    .find_node(far_id)
                    .await?
                    .ok_or(ControlError::NodeNotFound(far_id))?,
            ),
            None => None,
        };

        // `owned` is false only when an exhausted range handed back a port
        // someone else holds; that assignment must survive our failure paths
        let (port, owned) = match request.port {
            Some(port) if RESERVED_PORTS.contains(&port) => {
                return Err(ControlError::ReservedPort(port));
            }
            Some(port) => {
                self.allocator.reserve(port)?;
                (port, true)
            }
            None => {
                let allocation = self.allocator.allocate_random();
                (allocation.port, allocation.fresh)
            }
        };
        let release_owned = || {
            if owned {
                self.allocator.release(port);
            }
        };

        let holder = match self.store.active_on_port(port).await {
            Ok(holder) => holder,
            Err(e) => {
                release_owned();
                return Err(e.into());
            }
        };
        if let Some(holder) = holder {
            release_owned();
            return Err(ControlError::PortConflict {
                port,
                tunnel_id: holder.id,
            });
        }

        let config = Value::Object(request.config.clone()).to_string();
        let record = match self
            .store
            .insert_tunnel(NewTunnel {
                near_node_id: near.id,
                far_node_id: far.as_ref().map(|node| node.id),
                engine: kind.to_string(),
                transport: transport.clone(),
                port,
                priority: i32::from(entry.fallback_priority),
                config,
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                release_owned();
                return Err(e.into());
            }
        };

        self.tracking
            .register(port, TrackedTunnel::new(record.id, kind, transport.clone()));

        info!(
            tunnel_id = record.id,
            engine = %kind,
            transport = %transport,
            port,
            "Tunnel record created"
        );

        let options = build_start_options(&record, &near, far.as_ref(), &request.config);
        let start = self.start_record(&record, adapter.as_ref(), &options).await?;

        Ok(CreateTunnelResponse {
            tunnel_id: record.id,
            port,
            start,
        })
    }

    /// Start the adapter for a row; on failure the row is kept as `failed`
    /// and its port released
    async fn start_record(
        &self,
        record: &tunnel::Model,
        adapter: &dyn EngineAdapter,
        options: &StartOptions,
    ) -> Result<StartResult, ControlError> {
        match adapter.start(&runtime_id(record.id), options).await {
            Ok(outcome) => {
                let pid = outcome.pid.and_then(|pid| i32::try_from(pid).ok());
                self.store.set_pid(record.id, pid).await?;
                Ok(StartResult {
                    success: true,
                    pid: outcome.pid,
                    status: Some(outcome.status),
                    error: None,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    tunnel_id = record.id,
                    engine = %record.engine,
                    "Adapter start failed: {}",
                    message
                );
                self.store
                    .set_runtime(record.id, TunnelStatus::Failed, None, Some(message.clone()))
                    .await?;
                self.release_port_of(record).await?;
                Ok(StartResult::failed(message))
            }
        }
    }

    /// Release a row's port unless another active row holds it now
    async fn release_port_of(&self, record: &tunnel::Model) -> Result<(), ControlError> {
        let port = port_of(record)?;
        let holder = self.store.active_on_port(port).await?;
        if holder.is_some_and(|other| other.id != record.id) {
            debug!(
                tunnel_id = record.id,
                port, "Port now held by another tunnel, leaving it assigned"
            );
            return Ok(());
        }

        self.allocator.release(port);
        if self.tracking.tracks(port, record.id) {
            self.tracking.unregister(port);
        }
        Ok(())
    }

    /// Stop a tunnel; tolerates rows with no live process
    pub async fn stop_tunnel(&self, tunnel_id: i32) -> Result<StopResult, ControlError> {
        let record = self
            .store
            .find_tunnel(tunnel_id)
            .await?
            .ok_or(ControlError::TunnelNotFound(tunnel_id))?;

        let note = match self.adapter(&record.engine) {
            Ok((_, adapter)) => match adapter.stop(&runtime_id(tunnel_id)).await {
                Ok(outcome) if outcome.was_running => None,
                Ok(_) | Err(EngineError::NotFound(_)) => {
                    Some(NOTE_NO_ACTIVE_PROCESS.to_string())
                }
                Err(e) => {
                    warn!(tunnel_id, "Adapter stop failed: {}", e);
                    Some(e.to_string())
                }
            },
            Err(_) => Some(NOTE_NO_ACTIVE_PROCESS.to_string()),
        };

        self.store
            .set_runtime(tunnel_id, TunnelStatus::Inactive, None, record.last_error.clone())
            .await?;
        self.release_port_of(&record).await?;

        info!(tunnel_id, port = record.port, note = ?note, "Tunnel stopped");

        Ok(StopResult {
            success: true,
            note,
        })
    }

    /// Stop, then delete the row
    pub async fn delete_tunnel(&self, tunnel_id: i32) -> Result<StopResult, ControlError> {
        let result = self.stop_tunnel(tunnel_id).await?;
        self.store.delete_tunnel(tunnel_id).await?;
        info!(tunnel_id, "Tunnel deleted");
        Ok(result)
    }

    async fn runtime_of(&self, record: &tunnel::Model) -> Option<RuntimeState> {
        let (_, adapter) = self.adapter(&record.engine).ok()?;
        adapter.get_status(&runtime_id(record.id)).await
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelView>, ControlError> {
        let records = self.store.list_tunnels().await?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let runtime = self.runtime_of(&record).await;
            views.push(TunnelView { record, runtime });
        }
        Ok(views)
    }

    pub async fn get_status(&self, tunnel_id: i32) -> Result<TunnelView, ControlError> {
        let record = self
            .store
            .find_tunnel(tunnel_id)
            .await?
            .ok_or(ControlError::TunnelNotFound(tunnel_id))?;
        let runtime = self.runtime_of(&record).await;
        Ok(TunnelView { record, runtime })
    }

    /// Health of every active row; rows whose adapter gave up are persisted
    /// as `failed` with the adapter's last error and their port released
    pub async fn health_check_all(&self) -> Result<Vec<TunnelHealth>, ControlError> {
        let records = self.store.tunnels_with_status(TunnelStatus::Active).await?;
        let mut results = Vec::with_capacity(records.len());

        for record in records {
            let port = port_of(&record)?;
            let check = match self.adapter(&record.engine) {
                Ok((_, adapter)) => adapter
                    .health_check(&runtime_id(record.id))
                    .await
                    .map_err(ControlError::from),
                Err(e) => Err(e),
            };

            let mut record_status = record.status;
            let (health, error) = match check {
                Ok(report) => {
                    if report.status == EngineStatus::Failed {
                        warn!(
                            tunnel_id = record.id,
                            last_error = report.last_error.as_deref().unwrap_or("unknown"),
                            "Adapter exhausted its retries, marking tunnel failed"
                        );
                        self.store
                            .set_runtime(
                                record.id,
                                TunnelStatus::Failed,
                                None,
                                report.last_error.clone(),
                            )
                            .await?;
                        self.release_port_of(&record).await?;
                        record_status = TunnelStatus::Failed;
                    }
                    (Some(report), None)
                }
                Err(e) => (None, Some(e.to_string())),
            };

            results.push(TunnelHealth {
                tunnel_id: record.id,
                engine: record.engine.clone(),
                port,
                record_status,
                health,
                error,
            });
        }

        Ok(results)
    }

    /// Deployment artifacts for a stored row, rendered from the same options
    /// `start` would use
    pub async fn get_deployment_plan(&self, tunnel_id: i32) -> Result<DeployPlan, ControlError> {
        let record = self
            .store
            .find_tunnel(tunnel_id)
            .await?
            .ok_or(ControlError::TunnelNotFound(tunnel_id))?;
        let (_, adapter) = self.adapter(&record.engine)?;
        let options = self.options_for(&record).await?;
        Ok(adapter.generate_deploy_config(&options)?)
    }

    async fn options_for(&self, record: &tunnel::Model) -> Result<StartOptions, ControlError> {
        let near = self
            .store
            .find_node(record.near_node_id)
            .await?
            .ok_or(ControlError::NodeNotFound(record.near_node_id))?;
        let far = match record.far_node_id {
            Some(far_id) => Some(
                self.store
                    .find_node(far_id)
                    .await?
                    .ok_or(ControlError::NodeNotFound(far_id))?,
            ),
            None => None,
        };
        let config = parse_config(&record.config)?;
        Ok(build_start_options(record, &near, far.as_ref(), &config))
    }

    /// Rebuild the allocator and tracking map from active rows
    ///
    /// Must run before the first create after a process start.
    pub async fn restore(&self) -> Result<usize, ControlError> {
        let active = self.store.tunnels_with_status(TunnelStatus::Active).await?;

        let mut ports = Vec::with_capacity(active.len());
        self.tracking.clear();
        for record in &active {
            let port = port_of(record)?;
            ports.push(port);
            match EngineKind::from_str(&record.engine) {
                Ok(kind) => {
                    self.tracking.register(
                        port,
                        TrackedTunnel::new(record.id, kind, record.transport.clone()),
                    );
                }
                Err(_) => warn!(
                    tunnel_id = record.id,
                    engine = %record.engine,
                    "Active tunnel uses an unknown engine"
                ),
            }
        }

        let restored = self.allocator.import(ports);
        info!(restored, "Restored port assignments from active tunnels");
        Ok(restored)
    }

    /// Start adapters for active rows that have no live handle
    pub async fn resume_active(&self) -> Result<Vec<(i32, StartResult)>, ControlError> {
        let active = self.store.tunnels_with_status(TunnelStatus::Active).await?;
        let mut results = Vec::new();

        for record in active {
            let (_, adapter) = match self.adapter(&record.engine) {
                Ok(found) => found,
                Err(e) => {
                    results.push((record.id, StartResult::failed(e.to_string())));
                    continue;
                }
            };
            if adapter.get_status(&runtime_id(record.id)).await.is_some() {
                continue;
            }

            let result = match self.options_for(&record).await {
                Ok(options) => self.start_record(&record, adapter.as_ref(), &options).await?,
                Err(e) => {
                    self.store
                        .set_runtime(record.id, TunnelStatus::Failed, None, Some(e.to_string()))
                        .await?;
                    self.release_port_of(&record).await?;
                    StartResult::failed(e.to_string())
                }
            };

            info!(tunnel_id = record.id, success = result.success, "Resumed tunnel");
            results.push((record.id, result));
        }

        Ok(results)
    }

    /// Stop every live process without touching row status
    pub async fn shutdown(&self) {
        info!("Stopping all engine processes");
        self.engines.stop_all().await;
    }
}

fn parse_config(raw: &str) -> Result<Map<String, Value>, ControlError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ControlError::InvalidConfig(
            "config must be a JSON object".to_string(),
        )),
        Err(e) => Err(ControlError::InvalidConfig(e.to_string())),
    }
}

/// Derive adapter options from a row, its relay pair and the config blob
pub fn build_start_options(
    record: &tunnel::Model,
    near: &relay_node::Model,
    far: Option<&relay_node::Model>,
    config: &Map<String, Value>,
) -> StartOptions {
    let text = |key: &str| config.get(key).and_then(Value::as_str).map(str::to_string);
    let number = |key: &str| {
        config
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    };

    let mode = match text("mode").as_deref() {
        Some("server") => EngineMode::Server,
        _ => EngineMode::Client,
    };
    let port = u16::try_from(record.port).unwrap_or_default();

    let mut options = StartOptions::new(mode, port, record.transport.clone());

    // The client dials the far node; a server listens for the near one
    let peer = match mode {
        EngineMode::Client => far,
        EngineMode::Server => Some(near),
    };
    if let Some(peer) = peer {
        options.remote_host = peer.address.clone();
        options.remote_ssh_port = u16::try_from(peer.ssh_port).unwrap_or(22);
        options.remote_user = peer.ssh_user.clone();
    }
    if let Some(host) = text("remote_host") {
        options.remote_host = host;
    }
    if let Some(user) = text("remote_user") {
        options.remote_user = Some(user);
    }
    if let Some(ssh_port) = number("remote_ssh_port") {
        options.remote_ssh_port = ssh_port;
    }
    if let Some(local_port) = number("local_port") {
        options.local_port = local_port;
    }
    options.target = text("target").unwrap_or_else(|| format!("127.0.0.1:{}", options.local_port));
    options.token = text("token");
    options.binary = text("binary");
    options.extra = config.clone();

    options
}
