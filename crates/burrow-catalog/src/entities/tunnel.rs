//! Tunnel entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    /// Tunnel id (primary key, UUID string)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Human-readable name, unique across the relay
    #[sea_orm(unique)]
    pub name: String,

    /// Bearer token the agent authenticates with
    #[sea_orm(unique)]
    pub token: String,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::service::Entity")]
    Service,

    #[sea_orm(has_many = "super::check::Entity")]
    Check,
}

impl Related<super::service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Service.def()
    }
}

impl Related<super::check::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Check.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
