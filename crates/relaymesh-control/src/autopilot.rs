//! Autopilot Monitor: periodic, observational health sampling
//!
//! Every configured tunnel is kept running at the same time; a cycle only
//! writes samples and quality figures. The one status change it makes is
//! marking a row `failed` when every probe in its window errored.

use crate::error::ControlError;
use crate::probe::{ProbeTarget, Prober};
use crate::score::{Measurement, QualityBucket};
use crate::store::{
    NewSample, QualityUpdate, TunnelStore, SETTING_AUTOPILOT_ENABLED,
    SETTING_AUTOPILOT_LAST_CYCLE,
};
use crate::tracking::{TrackedTunnel, TrackingMap};
use chrono::{DateTime, Utc};
use relaymesh_engines::{EngineKind, FIXED_PORT_SERVICES};
use relaymesh_relay_db::entities::tunnel::{self, TunnelStatus};
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutopilotState {
    Idle,
    Monitoring,
    Error,
}

#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// Samples older than this are purged at the end of each cycle
    pub retention: Duration,
    /// Probes per target per cycle
    pub probe_attempts: u32,
    /// Upper bound for one probe
    pub probe_timeout: Duration,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(168 * 3600),
            probe_attempts: 3,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub tunnel_id: Option<i32>,
    pub measurement: Measurement,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub classes_probed: usize,
    pub services_probed: usize,
    pub records_probed: usize,
    pub samples_written: usize,
    pub samples_purged: u64,
    /// Rows newly marked `failed` this cycle
    pub records_failed: Vec<i32>,
    pub targets: Vec<TargetReport>,
}

/// Leaves `Monitoring` when a cycle ends, including when its future is dropped
struct CycleGuard<'a> {
    state: &'a Mutex<AutopilotState>,
    next: AutopilotState,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = self.next;
    }
}

pub struct Autopilot {
    store: TunnelStore,
    tracking: Arc<TrackingMap>,
    prober: Arc<dyn Prober>,
    config: AutopilotConfig,
    state: Mutex<AutopilotState>,
}

impl Autopilot {
    pub fn new(
        store: TunnelStore,
        tracking: Arc<TrackingMap>,
        prober: Arc<dyn Prober>,
        config: AutopilotConfig,
    ) -> Self {
        Self {
            store,
            tracking,
            prober,
            config,
            state: Mutex::new(AutopilotState::Idle),
        }
    }

    pub fn state(&self) -> AutopilotState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<CycleGuard<'_>, ControlError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == AutopilotState::Monitoring {
            return Err(ControlError::CycleInProgress);
        }
        *state = AutopilotState::Monitoring;
        Ok(CycleGuard {
            state: &self.state,
            next: AutopilotState::Idle,
        })
    }

    /// Enabled unless the setting is explicitly `"false"`
    pub async fn is_enabled(&self) -> Result<bool, ControlError> {
        let value = self.store.get_setting(SETTING_AUTOPILOT_ENABLED).await?;
        Ok(value.as_deref().map(str::trim) != Some("false"))
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ControlError> {
        self.store
            .set_setting(SETTING_AUTOPILOT_ENABLED, if enabled { "true" } else { "false" })
            .await?;
        info!(enabled, "Autopilot setting updated");
        Ok(())
    }

    pub async fn last_cycle(&self) -> Result<Option<DateTime<Utc>>, ControlError> {
        let value = self.store.get_setting(SETTING_AUTOPILOT_LAST_CYCLE).await?;
        Ok(value
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    /// Run one monitoring cycle; rejects overlapping triggers
    pub async fn run_cycle(&self) -> Result<CycleReport, ControlError> {
        let mut guard = self.begin()?;
        let result = self.cycle().await;
        match &result {
            Ok(report) => {
                info!(
                    classes = report.classes_probed,
                    services = report.services_probed,
                    records = report.records_probed,
                    samples = report.samples_written,
                    purged = report.samples_purged,
                    "Monitoring cycle completed"
                );
            }
            Err(e) => {
                guard.next = AutopilotState::Error;
                error!("Monitoring cycle failed: {}", e);
            }
        }
        result
    }

    async fn cycle(&self) -> Result<CycleReport, ControlError> {
        let started_at = Utc::now();
        let mut report = CycleReport {
            started_at,
            finished_at: started_at,
            classes_probed: 0,
            services_probed: 0,
            records_probed: 0,
            samples_written: 0,
            samples_purged: 0,
            records_failed: Vec::new(),
            targets: Vec::new(),
        };

        for engine in EngineKind::ALL {
            let target = ProbeTarget::EngineClass { engine };
            self.sample(&target, &mut report).await?;
            report.classes_probed += 1;
        }

        for service in FIXED_PORT_SERVICES {
            let target = ProbeTarget::FixedService {
                name: service.name.to_string(),
                port: service.port,
            };
            self.sample(&target, &mut report).await?;
            report.services_probed += 1;
        }

        for record in self.store.monitored_tunnels().await? {
            self.probe_record(&record, &mut report).await?;
            report.records_probed += 1;
        }

        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        report.samples_purged = self
            .store
            .purge_samples_before(Utc::now() - retention)
            .await?;

        report.finished_at = Utc::now();
        self.store
            .set_setting(SETTING_AUTOPILOT_LAST_CYCLE, &report.finished_at.to_rfc3339())
            .await?;

        Ok(report)
    }

    /// Probe a target `probe_attempts` times; errors count as lost probes
    async fn measure(&self, target: &ProbeTarget) -> Measurement {
        let mut latencies = Vec::with_capacity(self.config.probe_attempts as usize);

        for attempt in 1..=self.config.probe_attempts {
            match timeout(self.config.probe_timeout, self.prober.probe(target)).await {
                Ok(Ok(latency)) => latencies.push(latency),
                Ok(Err(e)) => debug!(probe = %target, attempt, "Probe failed: {}", e),
                Err(_) => debug!(probe = %target, attempt, "Probe timed out"),
            }
        }

        Measurement::from_latencies(&latencies, self.config.probe_attempts)
    }

    async fn sample(
        &self,
        target: &ProbeTarget,
        report: &mut CycleReport,
    ) -> Result<Measurement, ControlError> {
        let measurement = self.measure(target).await;

        self.store
            .insert_sample(NewSample {
                tunnel_id: target.tunnel_id(),
                engine: Some(target.label()),
                latency_ms: measurement.latency_ms,
                jitter_ms: measurement.jitter_ms,
                packet_loss: measurement.packet_loss,
                score: measurement.score,
                status: measurement.bucket.as_str().to_string(),
            })
            .await?;
        report.samples_written += 1;

        debug!(
            probe = %target,
            score = measurement.score,
            bucket = measurement.bucket.as_str(),
            "Sampled"
        );
        report.targets.push(TargetReport {
            target: target.to_string(),
            tunnel_id: target.tunnel_id(),
            measurement,
        });

        Ok(measurement)
    }

    async fn probe_record(
        &self,
        record: &tunnel::Model,
        report: &mut CycleReport,
    ) -> Result<(), ControlError> {
        let Ok(engine) = EngineKind::from_str(&record.engine) else {
            warn!(tunnel_id = record.id, engine = %record.engine, "Skipping tunnel with unknown engine");
            return Ok(());
        };
        let Ok(port) = u16::try_from(record.port) else {
            warn!(tunnel_id = record.id, port = record.port, "Skipping tunnel with invalid port");
            return Ok(());
        };

        // Active rows missing from the tracking map (created by another process)
        if record.status == TunnelStatus::Active && !self.tracking.tracks(port, record.id) {
            self.tracking.register(
                port,
                TrackedTunnel::new(record.id, engine, record.transport.clone()),
            );
        }

        let host = match record.far_node_id {
            Some(far_id) => self
                .store
                .find_node(far_id)
                .await?
                .map(|node| node.address)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            None => "127.0.0.1".to_string(),
        };

        let target = ProbeTarget::Tunnel {
            tunnel_id: record.id,
            engine,
            host,
            port,
        };
        let measurement = self.sample(&target, report).await?;

        if measurement.bucket == QualityBucket::Failed {
            self.store
                .update_quality(
                    record.id,
                    QualityUpdate {
                        score: 0.0,
                        latency_ms: None,
                        jitter_ms: None,
                    },
                )
                .await?;
            if record.status != TunnelStatus::Failed {
                let message = format!(
                    "all {} probe attempts failed during monitoring",
                    self.config.probe_attempts
                );
                warn!(tunnel_id = record.id, "{}", message);
                self.store
                    .set_runtime(record.id, TunnelStatus::Failed, record.pid, Some(message))
                    .await?;
                report.records_failed.push(record.id);
            }
        } else {
            self.store
                .update_quality(
                    record.id,
                    QualityUpdate {
                        score: measurement.score,
                        latency_ms: Some(measurement.latency_ms),
                        jitter_ms: Some(measurement.jitter_ms),
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Run cycles every `period` until `cancel` fires
    ///
    /// The enabled flag is re-read before each cycle; a cycle still running
    /// when the next tick arrives is not overlapped. Cancelling mid-cycle
    /// abandons the cycle and leaves the monitor `Idle`.
    pub async fn run_periodic(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(period_secs = period.as_secs(), "Autopilot started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.is_enabled().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Autopilot disabled, skipping cycle");
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read autopilot setting: {}", e);
                    continue;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_cycle() => {
                    if let Err(e) = result {
                        warn!("Autopilot cycle error: {}", e);
                    }
                }
            }
        }

        info!("Autopilot stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{MockProber, ProbeError, SimulatedProber};
    use crate::store::NewNode;
    use relaymesh_relay_db::entities::relay_node::NodeRole;

    async fn setup_store() -> TunnelStore {
        let db = relaymesh_relay_db::connect("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory database");
        relaymesh_relay_db::migrate(&db)
            .await
            .expect("Failed to run migrations");
        TunnelStore::new(db)
    }

    async fn insert_active(store: &TunnelStore, port: u16) -> tunnel::Model {
        let near = store
            .add_node(NewNode {
                name: format!("near-{}", port),
                role: NodeRole::Near,
                address: "10.0.0.1".to_string(),
                ssh_port: 22,
                ssh_user: None,
            })
            .await
            .unwrap();
        store
            .insert_tunnel(crate::store::NewTunnel {
                near_node_id: near.id,
                far_node_id: None,
                engine: "gost".to_string(),
                transport: "tls".to_string(),
                port,
                priority: 2,
                config: "{}".to_string(),
            })
            .await
            .unwrap()
    }

    fn autopilot(store: TunnelStore, prober: MockProber) -> Autopilot {
        Autopilot::new(
            store,
            Arc::new(TrackingMap::new()),
            Arc::new(prober),
            AutopilotConfig {
                probe_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_cycle_samples_classes_services_and_records() {
        let store = setup_store().await;
        let record = insert_active(&store, 24000).await;

        let mut prober = MockProber::new();
        prober.expect_probe().returning(|_| Ok(40.0));

        let autopilot = autopilot(store.clone(), prober);
        let report = autopilot.run_cycle().await.unwrap();

        assert_eq!(report.classes_probed, 5);
        assert_eq!(report.services_probed, 2);
        assert_eq!(report.records_probed, 1);
        assert_eq!(report.samples_written, 8);
        assert!(report.records_failed.is_empty());
        assert_eq!(autopilot.state(), AutopilotState::Idle);

        let updated = store.find_tunnel(record.id).await.unwrap().unwrap();
        assert_eq!(updated.status, TunnelStatus::Active);
        assert!((updated.score - 88.0).abs() < 1e-9);
        assert_eq!(updated.latency_ms, Some(40.0));
        assert_eq!(updated.jitter_ms, Some(0.0));

        assert!(autopilot.last_cycle().await.unwrap().is_some());
        assert!(autopilot.tracking.tracks(24000, record.id));
    }

    #[tokio::test]
    async fn test_all_probes_failing_marks_record_failed() {
        let store = setup_store().await;
        let record = insert_active(&store, 24001).await;

        let mut prober = MockProber::new();
        prober.expect_probe().returning(|target| match target {
            ProbeTarget::Tunnel { .. } => Err(ProbeError::Unreachable(target.to_string())),
            _ => Ok(30.0),
        });

        let autopilot = autopilot(store.clone(), prober);
        let report = autopilot.run_cycle().await.unwrap();
        assert_eq!(report.records_failed, vec![record.id]);

        let updated = store.find_tunnel(record.id).await.unwrap().unwrap();
        assert_eq!(updated.status, TunnelStatus::Failed);
        assert_eq!(updated.score, 0.0);

        let samples = store.samples_for_tunnel(record.id).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].status, "failed");
        assert_eq!(samples[0].packet_loss, 100.0);

        // A failed row is still monitored but not reported again
        let report = autopilot.run_cycle().await.unwrap();
        assert_eq!(report.records_probed, 1);
        assert!(report.records_failed.is_empty());
    }

    #[tokio::test]
    async fn test_partial_loss_keeps_record_active() {
        let store = setup_store().await;
        let record = insert_active(&store, 24002).await;

        let mut prober = MockProber::new();
        let mut calls = 0u32;
        prober.expect_probe().returning(move |_| {
            calls += 1;
            if calls % 3 == 0 {
                Err(ProbeError::Unreachable("lost".to_string()))
            } else {
                Ok(20.0)
            }
        });

        let autopilot = autopilot(store.clone(), prober);
        for _ in 0..3 {
            autopilot.run_cycle().await.unwrap();
        }

        let updated = store.find_tunnel(record.id).await.unwrap().unwrap();
        assert_eq!(updated.status, TunnelStatus::Active);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_rejected() {
        let store = setup_store().await;
        let autopilot = autopilot(store, MockProber::new());

        let guard = autopilot.begin().unwrap();
        assert!(matches!(
            autopilot.run_cycle().await,
            Err(ControlError::CycleInProgress)
        ));
        assert_eq!(autopilot.state(), AutopilotState::Monitoring);
        drop(guard);
        assert_eq!(autopilot.state(), AutopilotState::Idle);
    }

    fn slow_autopilot(store: TunnelStore) -> Autopilot {
        Autopilot::new(
            store,
            Arc::new(TrackingMap::new()),
            Arc::new(SimulatedProber {
                delay: Duration::from_millis(50),
                jitter_ms: 0.0,
                failure_rate: 0.0,
            }),
            AutopilotConfig {
                probe_attempts: 1,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_abandoned_cycle_returns_to_idle() {
        let store = setup_store().await;
        let autopilot = slow_autopilot(store);

        assert!(timeout(Duration::from_millis(20), autopilot.run_cycle())
            .await
            .is_err());
        assert_eq!(autopilot.state(), AutopilotState::Idle);

        let report = autopilot.run_cycle().await.unwrap();
        assert_eq!(report.classes_probed, 5);
        assert_eq!(autopilot.state(), AutopilotState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_during_cycle_leaves_monitor_idle() {
        let store = setup_store().await;
        let autopilot = slow_autopilot(store);
        let cancel = CancellationToken::new();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert_eq!(autopilot.state(), AutopilotState::Monitoring);
            cancel.cancel();
        };
        tokio::join!(
            autopilot.run_periodic(Duration::from_secs(60), cancel.clone()),
            stopper
        );

        assert_eq!(autopilot.state(), AutopilotState::Idle);
        assert!(autopilot.run_cycle().await.is_ok());
    }

    #[tokio::test]
    async fn test_enabled_flag_defaults_on() {
        let store = setup_store().await;
        let autopilot = autopilot(store, MockProber::new());

        assert!(autopilot.is_enabled().await.unwrap());
        autopilot.set_enabled(false).await.unwrap();
        assert!(!autopilot.is_enabled().await.unwrap());
        autopilot.set_enabled(true).await.unwrap();
        assert!(autopilot.is_enabled().await.unwrap());
    }
}
