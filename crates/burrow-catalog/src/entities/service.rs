//! Service entity: one public ingress rule

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Ingress type of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ServiceType {
    #[sea_orm(string_value = "http")]
    Http,

    #[sea_orm(string_value = "tcp")]
    Tcp,
}

/// TLS handling for HTTP services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TlsMode {
    #[sea_orm(string_value = "terminate")]
    Terminate,

    #[sea_orm(string_value = "passthrough")]
    Passthrough,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "services")]
pub struct Model {
    /// Service id (primary key, UUID string)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub tunnel_id: String,

    #[sea_orm(column_name = "type")]
    pub service_type: ServiceType,

    /// Public domain for HTTP services
    #[sea_orm(nullable)]
    pub domain: Option<String>,

    pub path_prefix: String,

    pub tls_mode: TlsMode,

    /// Relay-side listen address for TCP services
    #[sea_orm(nullable)]
    pub listen_addr: Option<String>,

    /// Address the agent dials locally
    pub target_addr: String,

    pub enabled: bool,

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
