//! Tunnel entity: the persisted tunnel registry row

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Registry status of a tunnel
///
/// At most one `Active` row may hold a given port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[sea_orm(string_value = "active")]
    Active,

    #[sea_orm(string_value = "inactive")]
    Inactive,

    #[sea_orm(string_value = "testing")]
    Testing,

    #[sea_orm(string_value = "failed")]
    Failed,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Inactive => "inactive",
            TunnelStatus::Testing => "testing",
            TunnelStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Near side of the relay pair
    pub near_node_id: i32,

    /// Far side of the relay pair (absent for single-ended engines)
    pub far_node_id: Option<i32>,

    /// Engine name from the catalog (ssh, frp, gost, chisel, trusttunnel)
    pub engine: String,

    pub transport: String,

    /// Assigned port, unique among active rows
    pub port: i32,

    pub status: TunnelStatus,

    /// Last quality score computed by the autopilot (0-100)
    pub score: f64,

    pub latency_ms: Option<f64>,

    pub jitter_ms: Option<f64>,

    /// Display ordering only, never used for switching
    pub priority: i32,

    /// Free-form engine option bag (JSON object)
    #[sea_orm(column_type = "Text")]
    pub config: String,

    /// Last adapter error, kept for failed rows
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Process id reported by the adapter on start
    pub pid: Option<i32>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::relay_node::Entity",
        from = "Column::NearNodeId",
        to = "super::relay_node::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    NearNode,

    #[sea_orm(has_many = "super::monitor_sample::Entity")]
    MonitorSample,
}

impl Related<super::relay_node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NearNode.def()
    }
}

impl Related<super::monitor_sample::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MonitorSample.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
