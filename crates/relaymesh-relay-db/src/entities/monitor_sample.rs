//! MonitorSample entity: append-only autopilot health history

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "monitor_samples")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Probed tunnel; NULL for class-level probes that precede any tunnel row
    pub tunnel_id: Option<i32>,

    /// Engine class or fixed service label the sample belongs to
    pub engine: Option<String>,

    pub latency_ms: f64,

    pub jitter_ms: f64,

    pub packet_loss: f64,

    pub score: f64,

    /// Quality bucket: optimal, degraded, poor or failed
    pub status: String,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
