//! Integration tests for the Tunnel Manager
//!
//! Uses an in-memory SQLite registry and an in-process fake adapter so the
//! orchestration rules can be checked without external binaries.

use async_trait::async_trait;
use relaymesh_control::{
    runtime_id, AllocatorConfig, Autopilot, AutopilotConfig, ControlError, CreateTunnelRequest,
    NewNode, NewTunnel, PortAllocator, SimulatedProber, TrackingMap, TunnelManager, TunnelStore,
    NOTE_NO_ACTIVE_PROCESS,
};
use relaymesh_engines::{
    Adapter, DeployPlan, EngineAdapter, EngineError, EngineKind, EngineMode, EngineRegistry,
    EngineStatus, GostDriver, HealthReport, RuntimeEvent, RuntimeState, StartOptions,
    StartOutcome, StopOutcome, SupervisorConfig,
};
use relaymesh_relay_db::entities::{relay_node::NodeRole, tunnel::TunnelStatus};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process adapter: tracks handles without spawning anything
struct FakeAdapter {
    kind: EngineKind,
    fail_start: bool,
    handles: Mutex<HashMap<String, RuntimeState>>,
    starts: Mutex<Vec<StartOptions>>,
    deploy: Adapter<GostDriver>,
}

impl FakeAdapter {
    fn new(kind: EngineKind, fail_start: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_start,
            handles: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            deploy: Adapter::new(GostDriver, SupervisorConfig::default()),
        })
    }

    /// Drop a handle as if the process vanished out-of-band
    fn forget(&self, tunnel_id: &str) {
        self.handles.lock().unwrap().remove(tunnel_id);
    }

    fn exhaust(&self, tunnel_id: &str) {
        let mut handles = self.handles.lock().unwrap();
        let state = handles.get_mut(tunnel_id).unwrap();
        state.apply(&RuntimeEvent::Exited {
            description: "exit code 1".to_string(),
        });
        state.apply(&RuntimeEvent::RetriesExhausted);
    }

    fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }
}

#[async_trait]
impl EngineAdapter for FakeAdapter {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn start(
        &self,
        tunnel_id: &str,
        options: &StartOptions,
    ) -> Result<StartOutcome, EngineError> {
        let mut handles = self.handles.lock().unwrap();
        if handles
            .get(tunnel_id)
            .is_some_and(|s| s.status != EngineStatus::Failed)
        {
            return Err(EngineError::AlreadyRunning(tunnel_id.to_string()));
        }
        self.starts.lock().unwrap().push(options.clone());

        if self.fail_start {
            return Err(EngineError::SpawnFailure {
                program: "gost".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let mut state = RuntimeState::new(tunnel_id, self.kind, options.mode);
        state.apply(&RuntimeEvent::Spawned { pid: Some(4242) });
        state.apply(&RuntimeEvent::Settled);
        let status = state.status;
        handles.insert(tunnel_id.to_string(), state);

        Ok(StartOutcome {
            pid: Some(4242),
            status,
        })
    }

    async fn stop(&self, tunnel_id: &str) -> Result<StopOutcome, EngineError> {
        match self.handles.lock().unwrap().remove(tunnel_id) {
            Some(state) => Ok(StopOutcome {
                was_running: state.pid.is_some(),
            }),
            None => Err(EngineError::NotFound(tunnel_id.to_string())),
        }
    }

    async fn get_status(&self, tunnel_id: &str) -> Option<RuntimeState> {
        self.handles.lock().unwrap().get(tunnel_id).cloned()
    }

    async fn health_check(&self, tunnel_id: &str) -> Result<HealthReport, EngineError> {
        let state = self
            .get_status(tunnel_id)
            .await
            .ok_or_else(|| EngineError::NotFound(tunnel_id.to_string()))?;
        Ok(HealthReport {
            healthy: state.status == EngineStatus::Connected,
            status: state.status,
            uptime_secs: state.uptime_secs(),
            retries: state.retries,
            last_error: state.last_error,
        })
    }

    fn generate_deploy_config(&self, options: &StartOptions) -> Result<DeployPlan, EngineError> {
        self.deploy.generate_deploy_config(options)
    }

    async fn tracked(&self) -> Vec<String> {
        self.handles.lock().unwrap().keys().cloned().collect()
    }
}

struct Fixture {
    manager: TunnelManager,
    store: TunnelStore,
    gost: Arc<FakeAdapter>,
    near_id: i32,
    far_id: i32,
}

async fn setup_test_db() -> TunnelStore {
    let db = relaymesh_relay_db::connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    relaymesh_relay_db::migrate(&db)
        .await
        .expect("Failed to run migrations");
    TunnelStore::new(db)
}

async fn fixture_with(gost: Arc<FakeAdapter>) -> Fixture {
    fixture_with_range(gost, AllocatorConfig::default()).await
}

async fn fixture_with_range(gost: Arc<FakeAdapter>, ports: AllocatorConfig) -> Fixture {
    let store = setup_test_db().await;

    let near = store
        .add_node(NewNode {
            name: "near-1".to_string(),
            role: NodeRole::Near,
            address: "198.51.100.1".to_string(),
            ssh_port: 22,
            ssh_user: Some("root".to_string()),
        })
        .await
        .unwrap();
    let far = store
        .add_node(NewNode {
            name: "far-1".to_string(),
            role: NodeRole::Far,
            address: "203.0.113.10".to_string(),
            ssh_port: 2222,
            ssh_user: Some("relay".to_string()),
        })
        .await
        .unwrap();

    let mut engines = EngineRegistry::new();
    engines.register(gost.clone());
    engines.register(FakeAdapter::new(EngineKind::Frp, false));

    let manager = TunnelManager::new(
        store.clone(),
        engines,
        Arc::new(PortAllocator::new(ports)),
        Arc::new(TrackingMap::new()),
    );

    Fixture {
        manager,
        store,
        gost,
        near_id: near.id,
        far_id: far.id,
    }
}

async fn fixture() -> Fixture {
    fixture_with(FakeAdapter::new(EngineKind::Gost, false)).await
}

fn gost_request(fx: &Fixture, port: Option<u16>) -> CreateTunnelRequest {
    CreateTunnelRequest {
        engine: "gost".to_string(),
        near_node_id: fx.near_id,
        far_node_id: Some(fx.far_id),
        port,
        transport: "tls".to_string(),
        config: Map::new(),
    }
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ports() {
    let fx = fixture().await;

    let creates = (0..5).map(|_| {
        let manager = fx.manager.clone();
        let request = gost_request(&fx, None);
        async move { manager.create_tunnel(request).await }
    });
    let results = futures::future::join_all(creates).await;

    let mut ports = HashSet::new();
    for result in results {
        let response = result.unwrap();
        assert!(response.start.success);
        assert!((10000..=65000).contains(&response.port));
        assert!(ports.insert(response.port));
    }

    let active = fx
        .store
        .tunnels_with_status(TunnelStatus::Active)
        .await
        .unwrap();
    assert_eq!(active.len(), 5);
    assert_eq!(fx.manager.allocator().len(), 5);
    assert_eq!(fx.manager.tracking().len(), 5);
    assert_eq!(fx.gost.start_count(), 5);
}

#[tokio::test]
async fn test_reserved_ports_are_rejected() {
    let fx = fixture().await;
    fx.manager.create_tunnel(gost_request(&fx, Some(24000))).await.unwrap();
    let before = fx.manager.allocator().snapshot();

    for port in [80, 443] {
        let err = fx
            .manager
            .create_tunnel(gost_request(&fx, Some(port)))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ReservedPort(p) if p == port));
        assert_eq!(err.report().code, "reserved_port");
    }

    assert_eq!(fx.manager.allocator().snapshot(), before);
    assert_eq!(fx.store.list_tunnels().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_explicit_port_twice_is_in_use() {
    let fx = fixture().await;
    let first = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24000)))
        .await
        .unwrap();
    assert_eq!(first.port, 24000);

    let err = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24000)))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::PortInUse(24000)));
}

#[tokio::test]
async fn test_active_row_on_port_is_a_conflict() {
    let fx = fixture().await;
    let first = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24000)))
        .await
        .unwrap();

    // Allocator lost the assignment, e.g. a restart without restore()
    fx.manager.allocator().release(24000);

    let err = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24000)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::PortConflict { port: 24000, tunnel_id } if tunnel_id == first.tunnel_id
    ));
    assert!(!fx.manager.allocator().is_assigned(24000));
}

#[tokio::test]
async fn test_conflict_on_exhausted_range_keeps_holder_assignment() {
    let fx = fixture_with_range(
        FakeAdapter::new(EngineKind::Gost, false),
        AllocatorConfig::new(30000, 30000),
    )
    .await;

    let first = fx.manager.create_tunnel(gost_request(&fx, None)).await.unwrap();
    assert_eq!(first.port, 30000);

    // The only port in range is handed out again and hits the active row
    let err = fx
        .manager
        .create_tunnel(gost_request(&fx, None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::PortConflict { port: 30000, tunnel_id } if tunnel_id == first.tunnel_id
    ));

    assert!(fx.manager.allocator().is_assigned(30000));
    assert!(fx.manager.tracking().tracks(30000, first.tunnel_id));
    let record = fx.store.find_tunnel(first.tunnel_id).await.unwrap().unwrap();
    assert_eq!(record.status, TunnelStatus::Active);
    assert_eq!(fx.store.list_tunnels().await.unwrap().len(), 1);

    // A third create still conflicts instead of reusing a freed port
    assert!(matches!(
        fx.manager.create_tunnel(gost_request(&fx, None)).await,
        Err(ControlError::PortConflict { port: 30000, .. })
    ));
}

#[tokio::test]
async fn test_input_validation() {
    let fx = fixture().await;

    let mut request = gost_request(&fx, None);
    request.engine = "wireguard".to_string();
    assert!(matches!(
        fx.manager.create_tunnel(request).await,
        Err(ControlError::UnknownEngine(_))
    ));

    let mut request = gost_request(&fx, None);
    request.near_node_id = 999;
    assert!(matches!(
        fx.manager.create_tunnel(request).await,
        Err(ControlError::NodeNotFound(999))
    ));

    let mut request = gost_request(&fx, None);
    request.transport = "carrier-pigeon".to_string();
    assert!(matches!(
        fx.manager.create_tunnel(request).await,
        Err(ControlError::UnsupportedTransport { .. })
    ));

    // Registered kinds only: ssh has no adapter in this fixture
    let mut request = gost_request(&fx, None);
    request.engine = "ssh".to_string();
    assert!(matches!(
        fx.manager.create_tunnel(request).await,
        Err(ControlError::UnknownEngine(_))
    ));

    assert!(fx.manager.allocator().is_empty());
    assert!(fx.store.list_tunnels().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_transport_uses_engine_default() {
    let fx = fixture().await;
    let mut request = gost_request(&fx, None);
    request.transport = String::new();

    let response = fx.manager.create_tunnel(request).await.unwrap();
    let view = fx.manager.get_status(response.tunnel_id).await.unwrap();
    assert_eq!(view.record.transport, "tls");
    assert_eq!(view.record.priority, 2);
}

#[tokio::test]
async fn test_start_options_come_from_nodes_and_config() {
    let fx = fixture().await;
    let mut request = gost_request(&fx, Some(24010));
    request.config = json!({"token": "s3cret", "local_port": 1080})
        .as_object()
        .cloned()
        .unwrap();

    fx.manager.create_tunnel(request).await.unwrap();

    let starts = fx.gost.starts.lock().unwrap().clone();
    let options = &starts[0];
    assert_eq!(options.mode, EngineMode::Client);
    assert_eq!(options.port, 24010);
    assert_eq!(options.remote_host, "203.0.113.10");
    assert_eq!(options.remote_ssh_port, 2222);
    assert_eq!(options.local_port, 1080);
    assert_eq!(options.token.as_deref(), Some("s3cret"));
}

#[tokio::test]
async fn test_adapter_failure_keeps_row_and_releases_port() {
    let fx = fixture_with(FakeAdapter::new(EngineKind::Gost, true)).await;

    let response = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24020)))
        .await
        .unwrap();
    assert!(!response.start.success);
    assert!(response.start.error.unwrap().contains("Failed to spawn gost"));

    let record = fx
        .store
        .find_tunnel(response.tunnel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TunnelStatus::Failed);
    assert!(record.last_error.is_some());

    assert!(!fx.manager.allocator().is_assigned(24020));
    assert!(fx.manager.tracking().is_empty());
}

#[tokio::test]
async fn test_stop_orphaned_record() {
    let fx = fixture().await;
    let response = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24030)))
        .await
        .unwrap();

    fx.gost.forget(&runtime_id(response.tunnel_id));

    let result = fx.manager.stop_tunnel(response.tunnel_id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.note.as_deref(), Some(NOTE_NO_ACTIVE_PROCESS));

    let record = fx
        .store
        .find_tunnel(response.tunnel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TunnelStatus::Inactive);
    assert!(!fx.manager.allocator().is_assigned(24030));

    // Immediately reusable
    let again = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(24030)))
        .await
        .unwrap();
    assert_eq!(again.port, 24030);
}

#[tokio::test]
async fn test_stop_and_delete_tracked_tunnel() {
    let fx = fixture().await;
    let response = fx
        .manager
        .create_tunnel(gost_request(&fx, None))
        .await
        .unwrap();

    let result = fx.manager.stop_tunnel(response.tunnel_id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.note, None);
    assert!(fx
        .gost
        .get_status(&runtime_id(response.tunnel_id))
        .await
        .is_none());

    let result = fx.manager.delete_tunnel(response.tunnel_id).await.unwrap();
    assert!(result.success);
    assert!(matches!(
        fx.manager.get_status(response.tunnel_id).await,
        Err(ControlError::TunnelNotFound(_))
    ));
    assert!(fx.manager.allocator().is_empty());

    assert!(matches!(
        fx.manager.stop_tunnel(response.tunnel_id).await,
        Err(ControlError::TunnelNotFound(_))
    ));
}

#[tokio::test]
async fn test_list_joins_runtime_state() {
    let fx = fixture().await;
    let live = fx.manager.create_tunnel(gost_request(&fx, None)).await.unwrap();
    let orphan = fx.manager.create_tunnel(gost_request(&fx, None)).await.unwrap();
    fx.gost.forget(&runtime_id(orphan.tunnel_id));

    let views = fx.manager.list_tunnels().await.unwrap();
    assert_eq!(views.len(), 2);

    let by_id: HashMap<i32, _> = views.into_iter().map(|v| (v.record.id, v)).collect();
    let runtime = by_id[&live.tunnel_id].runtime.as_ref().unwrap();
    assert_eq!(runtime.status, EngineStatus::Connected);
    assert!(by_id[&orphan.tunnel_id].runtime.is_none());
}

#[tokio::test]
async fn test_health_check_all_persists_failures() {
    let fx = fixture().await;
    let healthy = fx.manager.create_tunnel(gost_request(&fx, None)).await.unwrap();
    let broken = fx.manager.create_tunnel(gost_request(&fx, None)).await.unwrap();
    fx.gost.exhaust(&runtime_id(broken.tunnel_id));

    let report = fx.manager.health_check_all().await.unwrap();
    assert_eq!(report.len(), 2);

    let healthy_entry = report.iter().find(|h| h.tunnel_id == healthy.tunnel_id).unwrap();
    assert!(healthy_entry.health.as_ref().unwrap().healthy);

    let broken_entry = report.iter().find(|h| h.tunnel_id == broken.tunnel_id).unwrap();
    assert_eq!(broken_entry.record_status, TunnelStatus::Failed);

    let record = fx
        .store
        .find_tunnel(broken.tunnel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TunnelStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("exit code 1"));

    // The failed row gives its port back; the healthy one keeps its own
    assert!(!fx.manager.allocator().is_assigned(broken.port));
    assert!(fx.manager.tracking().get(broken.port).is_none());
    assert!(fx.manager.allocator().is_assigned(healthy.port));
    assert!(fx.manager.tracking().tracks(healthy.port, healthy.tunnel_id));

    // The port can be reused right away
    let reuse = fx
        .manager
        .create_tunnel(gost_request(&fx, Some(broken.port)))
        .await
        .unwrap();
    assert!(reuse.start.success);
}

#[tokio::test]
async fn test_restore_rebuilds_allocator_and_tracking() {
    let fx = fixture().await;

    for (port, status) in [(24100, TunnelStatus::Active), (24101, TunnelStatus::Inactive)] {
        let row = fx
            .store
            .insert_tunnel(NewTunnel {
                near_node_id: fx.near_id,
                far_node_id: Some(fx.far_id),
                engine: "gost".to_string(),
                transport: "tls".to_string(),
                port,
                priority: 2,
                config: "{}".to_string(),
            })
            .await
            .unwrap();
        fx.store.set_runtime(row.id, status, None, None).await.unwrap();
    }

    assert_eq!(fx.manager.restore().await.unwrap(), 1);
    assert!(fx.manager.allocator().is_assigned(24100));
    assert!(!fx.manager.allocator().is_assigned(24101));
    assert!(fx.manager.tracking().get(24100).is_some());

    assert!(matches!(
        fx.manager.create_tunnel(gost_request(&fx, Some(24100))).await,
        Err(ControlError::PortInUse(24100))
    ));

    // Active rows without a handle get started
    let resumed = fx.manager.resume_active().await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert!(resumed[0].1.success);
    assert_eq!(fx.gost.start_count(), 1);

    // Second pass finds the handle and skips it
    assert!(fx.manager.resume_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deployment_plan_for_stored_record() {
    let fx = fixture().await;
    let mut request = gost_request(&fx, Some(24200));
    request.config = json!({"mode": "server", "token": "s3cret"})
        .as_object()
        .cloned()
        .unwrap();
    let response = fx.manager.create_tunnel(request).await.unwrap();

    let plan = fx
        .manager
        .get_deployment_plan(response.tunnel_id)
        .await
        .unwrap();
    assert_eq!(plan.unit_name, "relaymesh-gost-24200");
    assert!(plan.command.starts_with("gost -L "));
    assert!(plan.supervisor_unit.contains("Restart=always"));
}

#[tokio::test]
async fn test_monitoring_never_flips_activity() {
    let fx = fixture().await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(fx.manager.create_tunnel(gost_request(&fx, None)).await.unwrap().tunnel_id);
    }
    fx.manager.stop_tunnel(ids[2]).await.unwrap();

    let autopilot = Autopilot::new(
        fx.store.clone(),
        fx.manager.tracking().clone(),
        Arc::new(SimulatedProber {
            delay: Duration::ZERO,
            jitter_ms: 10.0,
            failure_rate: 0.0,
        }),
        AutopilotConfig::default(),
    );

    for _ in 0..5 {
        let report = autopilot.run_cycle().await.unwrap();
        assert_eq!(report.records_probed, 2);
    }

    for (i, id) in ids.iter().enumerate() {
        let record = fx.store.find_tunnel(*id).await.unwrap().unwrap();
        let expected = if i == 2 {
            TunnelStatus::Inactive
        } else {
            TunnelStatus::Active
        };
        assert_eq!(record.status, expected);
    }

    let samples = fx.store.samples_for_tunnel(ids[0]).await.unwrap();
    assert_eq!(samples.len(), 5);
    assert!(samples.iter().all(|s| s.score > 50.0));
    assert_eq!(samples[0].status, "optimal");
}
