//! Read/write access to the persisted tunnel registry

use chrono::{DateTime, Utc};
use relaymesh_relay_db::entities::{
    monitor_sample, relay_node, setting,
    tunnel::{self, TunnelStatus},
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, Unchanged,
};
use std::sync::Arc;

/// Settings key: autopilot on/off (`"true"` / `"false"`)
pub const SETTING_AUTOPILOT_ENABLED: &str = "autopilot_enabled";
/// Settings key: RFC 3339 timestamp of the last finished cycle
pub const SETTING_AUTOPILOT_LAST_CYCLE: &str = "autopilot_last_cycle";

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub role: relay_node::NodeRole,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub near_node_id: i32,
    pub far_node_id: Option<i32>,
    pub engine: String,
    pub transport: String,
    pub port: u16,
    pub priority: i32,
    pub config: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub tunnel_id: Option<i32>,
    pub engine: Option<String>,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub score: f64,
    pub status: String,
}

/// Quality figures written back to a tunnel row by the autopilot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityUpdate {
    pub score: f64,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

/// Database-backed tunnel registry
#[derive(Clone)]
pub struct TunnelStore {
    db: Arc<DatabaseConnection>,
}

impl TunnelStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    // Relay nodes

    pub async fn add_node(&self, node: NewNode) -> Result<relay_node::Model, DbErr> {
        relay_node::ActiveModel {
            name: Set(node.name),
            role: Set(node.role),
            address: Set(node.address),
            ssh_port: Set(i32::from(node.ssh_port)),
            ssh_user: Set(node.ssh_user),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(self.connection())
        .await
    }

    pub async fn find_node(&self, id: i32) -> Result<Option<relay_node::Model>, DbErr> {
        relay_node::Entity::find_by_id(id).one(self.connection()).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<relay_node::Model>, DbErr> {
        relay_node::Entity::find()
            .order_by_asc(relay_node::Column::Id)
            .all(self.connection())
            .await
    }

    // Tunnels

    /// Insert an `active` row
    pub async fn insert_tunnel(&self, new: NewTunnel) -> Result<tunnel::Model, DbErr> {
        let now = Utc::now();
        tunnel::ActiveModel {
            near_node_id: Set(new.near_node_id),
            far_node_id: Set(new.far_node_id),
            engine: Set(new.engine),
            transport: Set(new.transport),
            port: Set(i32::from(new.port)),
            status: Set(TunnelStatus::Active),
            score: Set(0.0),
            latency_ms: Set(None),
            jitter_ms: Set(None),
            priority: Set(new.priority),
            config: Set(new.config),
            last_error: Set(None),
            pid: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(self.connection())
        .await
    }

    pub async fn find_tunnel(&self, id: i32) -> Result<Option<tunnel::Model>, DbErr> {
        tunnel::Entity::find_by_id(id).one(self.connection()).await
    }

    pub async fn list_tunnels(&self) -> Result<Vec<tunnel::Model>, DbErr> {
        tunnel::Entity::find()
            .order_by_asc(tunnel::Column::Id)
            .all(self.connection())
            .await
    }

    pub async fn tunnels_with_status(
        &self,
        status: TunnelStatus,
    ) -> Result<Vec<tunnel::Model>, DbErr> {
        tunnel::Entity::find()
            .filter(tunnel::Column::Status.eq(status))
            .order_by_asc(tunnel::Column::Id)
            .all(self.connection())
            .await
    }

    /// Rows the autopilot re-probes (everything not `inactive`)
    pub async fn monitored_tunnels(&self) -> Result<Vec<tunnel::Model>, DbErr> {
        tunnel::Entity::find()
            .filter(tunnel::Column::Status.ne(TunnelStatus::Inactive))
            .order_by_asc(tunnel::Column::Id)
            .all(self.connection())
            .await
    }

    /// The active row holding `port`, if any
    pub async fn active_on_port(&self, port: u16) -> Result<Option<tunnel::Model>, DbErr> {
        tunnel::Entity::find()
            .filter(tunnel::Column::Port.eq(i32::from(port)))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active))
            .one(self.connection())
            .await
    }

    /// Update status, pid and last error in one write
    pub async fn set_runtime(
        &self,
        id: i32,
        status: TunnelStatus,
        pid: Option<i32>,
        last_error: Option<String>,
    ) -> Result<tunnel::Model, DbErr> {
        tunnel::ActiveModel {
            id: Unchanged(id),
            status: Set(status),
            pid: Set(pid),
            last_error: Set(last_error),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(self.connection())
        .await
    }

    pub async fn set_pid(&self, id: i32, pid: Option<i32>) -> Result<tunnel::Model, DbErr> {
        tunnel::ActiveModel {
            id: Unchanged(id),
            pid: Set(pid),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(self.connection())
        .await
    }

    pub async fn update_quality(
        &self,
        id: i32,
        quality: QualityUpdate,
    ) -> Result<tunnel::Model, DbErr> {
        tunnel::ActiveModel {
            id: Unchanged(id),
            score: Set(quality.score),
            latency_ms: Set(quality.latency_ms),
            jitter_ms: Set(quality.jitter_ms),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(self.connection())
        .await
    }

    /// Returns whether a row was deleted
    pub async fn delete_tunnel(&self, id: i32) -> Result<bool, DbErr> {
        let result = tunnel::Entity::delete_by_id(id)
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected > 0)
    }

    // Monitor samples

    pub async fn insert_sample(&self, sample: NewSample) -> Result<monitor_sample::Model, DbErr> {
        monitor_sample::ActiveModel {
            tunnel_id: Set(sample.tunnel_id),
            engine: Set(sample.engine),
            latency_ms: Set(sample.latency_ms),
            jitter_ms: Set(sample.jitter_ms),
            packet_loss: Set(sample.packet_loss),
            score: Set(sample.score),
            status: Set(sample.status),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(self.connection())
        .await
    }

    /// Delete samples created before `cutoff`; returns the number removed
    pub async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbErr> {
        let result = monitor_sample::Entity::delete_many()
            .filter(monitor_sample::Column::CreatedAt.lt(cutoff))
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected)
    }

    /// Most recent samples, newest first
    pub async fn recent_samples(&self, limit: u64) -> Result<Vec<monitor_sample::Model>, DbErr> {
        monitor_sample::Entity::find()
            .order_by_desc(monitor_sample::Column::CreatedAt)
            .order_by_desc(monitor_sample::Column::Id)
            .limit(limit)
            .all(self.connection())
            .await
    }

    pub async fn samples_for_tunnel(
        &self,
        tunnel_id: i32,
    ) -> Result<Vec<monitor_sample::Model>, DbErr> {
        monitor_sample::Entity::find()
            .filter(monitor_sample::Column::TunnelId.eq(tunnel_id))
            .order_by_asc(monitor_sample::Column::Id)
            .all(self.connection())
            .await
    }

    // Settings

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, DbErr> {
        Ok(setting::Entity::find_by_id(key.to_string())
            .one(self.connection())
            .await?
            .map(|row| row.value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), DbErr> {
        let existing = setting::Entity::find_by_id(key.to_string())
            .one(self.connection())
            .await?;

        match existing {
            Some(row) => {
                let mut active: setting::ActiveModel = row.into();
                active.value = Set(value.to_string());
                active.updated_at = Set(Utc::now());
                active.update(self.connection()).await?;
            }
            None => {
                setting::ActiveModel {
                    key: Set(key.to_string()),
                    value: Set(value.to_string()),
                    updated_at: Set(Utc::now()),
                }
                .insert(self.connection())
                .await?;
            }
        }
        Ok(())
    }
}
