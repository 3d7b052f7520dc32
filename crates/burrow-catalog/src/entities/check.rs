//! Check entity: one row of the uptime ledger

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Recorded availability state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
pub enum CheckStatus {
    #[sea_orm(string_value = "up")]
    Up,

    #[sea_orm(string_value = "down")]
    Down,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(indexed)]
    pub tunnel_id: String,

    pub status: CheckStatus,

    /// Ping round trip in milliseconds, when the row came from a probe
    #[sea_orm(nullable)]
    pub latency_ms: Option<i32>,

    /// Error text for down transitions
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
