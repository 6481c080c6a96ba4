//! RelayNode entity: one endpoint of a relay pair

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Which side of the relay pair a node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[sea_orm(string_value = "near")]
    Near,

    #[sea_orm(string_value = "far")]
    Far,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "relay_nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Operator-facing node name
    #[sea_orm(unique)]
    pub name: String,

    pub role: NodeRole,

    /// Reachable host name or IP address
    pub address: String,

    /// SSH port used by the ssh engine and by deployment scripts
    pub ssh_port: i32,

    pub ssh_user: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
