//! The shared adapter contract and the engine registry

use crate::catalog::EngineKind;
use crate::deploy::{build_plan, DeployPlan};
use crate::driver::EngineDriver;
use crate::engines::{ChiselDriver, FrpDriver, GostDriver, SshDriver, TrustTunnelDriver};
use crate::error::EngineError;
use crate::options::StartOptions;
use crate::policy::ReconnectPolicy;
use crate::runtime::{EngineStatus, RuntimeEvent, RuntimeState};
use crate::supervisor::{launch, read_proc_io, write_config_files, Handles, RuntimeHandle, Supervision};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a successful `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub pid: Option<u32>,
    pub status: EngineStatus,
}

/// Result of a successful `stop`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopOutcome {
    /// False when the process had already exited before the stop
    pub was_running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: EngineStatus,
    pub uptime_secs: Option<u64>,
    pub retries: u32,
    pub last_error: Option<String>,
}

/// Uniform lifecycle contract implemented by every engine
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Render config, launch the process and arm the reconnect policy
    async fn start(&self, tunnel_id: &str, options: &StartOptions)
        -> Result<StartOutcome, EngineError>;

    /// Stop the process (SIGTERM, SIGKILL after the grace period) and drop its handle
    async fn stop(&self, tunnel_id: &str) -> Result<StopOutcome, EngineError>;

    async fn get_status(&self, tunnel_id: &str) -> Option<RuntimeState>;

    async fn health_check(&self, tunnel_id: &str) -> Result<HealthReport, EngineError>;

    /// Render the command line, systemd unit and setup script; no side effects
    fn generate_deploy_config(&self, options: &StartOptions) -> Result<DeployPlan, EngineError>;

    /// Tunnel ids with a live or failed handle
    async fn tracked(&self) -> Vec<String>;

    async fn stop_all(&self) {
        for tunnel_id in self.tracked().await {
            if let Err(e) = self.stop(&tunnel_id).await {
                warn!(tunnel_id = %tunnel_id, "Failed to stop tunnel: {}", e);
            }
        }
    }
}

/// Settings shared by every adapter instance
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Rendered config files go under `<work_dir>/<engine>/<tunnel_id>/`
    pub work_dir: PathBuf,
    pub policy: ReconnectPolicy,
    /// Time a process must stay alive before it counts as connected
    pub settle_delay: Duration,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("relaymesh"),
            policy: ReconnectPolicy::default(),
            settle_delay: Duration::from_secs(3),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Generic adapter: one [`EngineDriver`] plus process supervision
pub struct Adapter<D> {
    driver: Arc<D>,
    config: SupervisorConfig,
    handles: Handles,
}

impl<D: EngineDriver> Adapter<D> {
    pub fn new(driver: D, config: SupervisorConfig) -> Self {
        Self {
            driver: Arc::new(driver),
            config,
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn config_dir(&self, tunnel_id: &str) -> PathBuf {
        let safe: String = tunnel_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.config
            .work_dir
            .join(self.driver.kind().as_str())
            .join(safe)
    }

    fn is_live(handle: &RuntimeHandle) -> bool {
        handle.state.status != EngineStatus::Failed
    }
}

#[async_trait]
impl<D: EngineDriver> EngineAdapter for Adapter<D> {
    fn kind(&self) -> EngineKind {
        self.driver.kind()
    }

    async fn start(
        &self,
        tunnel_id: &str,
        options: &StartOptions,
    ) -> Result<StartOutcome, EngineError> {
        if let Some(handle) = self.handles.read().await.get(tunnel_id) {
            if Self::is_live(handle) {
                return Err(EngineError::AlreadyRunning(tunnel_id.to_string()));
            }
        }

        let spec = self
            .driver
            .render(tunnel_id, options, &self.config_dir(tunnel_id))?;
        write_config_files(&spec).await?;

        let pid = {
            let mut handles = self.handles.write().await;
            if handles.get(tunnel_id).is_some_and(Self::is_live) {
                return Err(EngineError::AlreadyRunning(tunnel_id.to_string()));
            }

            let child = launch(&spec)?;
            let pid = child.id();

            let mut state = RuntimeState::new(tunnel_id, self.driver.kind(), options.mode);
            state.apply(&RuntimeEvent::Spawned { pid });

            let cancel = CancellationToken::new();
            let supervision = Supervision {
                driver: self.driver.clone(),
                handles: self.handles.clone(),
                tunnel_id: tunnel_id.to_string(),
                spec: spec.clone(),
                policy: self.config.policy.clone(),
                settle_delay: self.config.settle_delay,
                stop_grace: self.config.stop_grace,
                cancel: cancel.clone(),
            };
            let task = tokio::spawn(supervision.run(child));

            handles.insert(
                tunnel_id.to_string(),
                RuntimeHandle {
                    state,
                    cancel,
                    task: Some(task),
                },
            );
            pid
        };

        info!(
            tunnel_id = %tunnel_id,
            engine = %self.driver.kind(),
            pid = ?pid,
            command = %spec.command_line(),
            "Engine process started"
        );

        if !self.config.settle_delay.is_zero() {
            sleep(self.config.settle_delay).await;
        }

        let status = self
            .get_status(tunnel_id)
            .await
            .map(|state| state.status)
            .unwrap_or(EngineStatus::Connecting);

        Ok(StartOutcome { pid, status })
    }

    async fn stop(&self, tunnel_id: &str) -> Result<StopOutcome, EngineError> {
        let (cancel, task, was_running) = {
            let mut handles = self.handles.write().await;
            let handle = handles
                .get_mut(tunnel_id)
                .ok_or_else(|| EngineError::NotFound(tunnel_id.to_string()))?;

            let was_running = handle.state.pid.is_some();
            handle.state.apply(&RuntimeEvent::StopRequested);
            (handle.cancel.clone(), handle.task.take(), was_running)
        };

        cancel.cancel();

        if let Some(task) = task {
            // The supervision task needs at most one grace period to reap the child
            if timeout(self.config.stop_grace * 2, task).await.is_err() {
                warn!(tunnel_id = %tunnel_id, "Supervision task did not finish in time");
            }
        }

        self.handles.write().await.remove(tunnel_id);
        info!(tunnel_id = %tunnel_id, engine = %self.driver.kind(), "Engine process stopped");

        Ok(StopOutcome { was_running })
    }

    async fn get_status(&self, tunnel_id: &str) -> Option<RuntimeState> {
        let mut state = self.handles.read().await.get(tunnel_id)?.state.clone();
        if let Some((rx, tx)) = state.pid.and_then(read_proc_io) {
            state.rx_bytes = Some(rx);
            state.tx_bytes = Some(tx);
        }
        Some(state)
    }

    async fn health_check(&self, tunnel_id: &str) -> Result<HealthReport, EngineError> {
        let state = self
            .get_status(tunnel_id)
            .await
            .ok_or_else(|| EngineError::NotFound(tunnel_id.to_string()))?;

        Ok(HealthReport {
            healthy: state.status == EngineStatus::Connected && state.pid.is_some(),
            status: state.status,
            uptime_secs: state.uptime_secs(),
            retries: state.retries,
            last_error: state.last_error,
        })
    }

    fn generate_deploy_config(&self, options: &StartOptions) -> Result<DeployPlan, EngineError> {
        build_plan(self.driver.as_ref(), options)
    }

    async fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Maps engine kind to its adapter instance
#[derive(Clone, Default)]
pub struct EngineRegistry {
    adapters: HashMap<EngineKind, Arc<dyn EngineAdapter>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all five engines sharing one supervisor config
    pub fn with_defaults(config: SupervisorConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Adapter::new(SshDriver, config.clone())));
        registry.register(Arc::new(Adapter::new(FrpDriver, config.clone())));
        registry.register(Arc::new(Adapter::new(GostDriver, config.clone())));
        registry.register(Arc::new(Adapter::new(ChiselDriver, config.clone())));
        registry.register(Arc::new(Adapter::new(TrustTunnelDriver, config)));
        registry
    }

    /// Register an adapter, replacing any previous one for the same kind
    pub fn register(&mut self, adapter: Arc<dyn EngineAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn EngineAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<EngineKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub async fn stop_all(&self) {
        for kind in self.kinds() {
            if let Some(adapter) = self.get(kind) {
                adapter.stop_all().await;
            }
        }
    }
}
