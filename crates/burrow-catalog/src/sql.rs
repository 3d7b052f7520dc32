//! SQLite catalog on sea-orm.

use crate::entities::prelude::{Check as CheckEntity, Service as ServiceEntity, Tunnel as TunnelEntity};
use crate::entities::{check, service, tunnel};
use crate::migrator::Migrator;
use crate::model::{
    Check, CheckStatus, NewCheck, NewService, Service, TlsMode, Tunnel, UptimeStats,
};
use crate::{generate_token, token_matches, Catalog, CatalogError};
use async_trait::async_trait;
use burrow_proto::ServiceKind;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use sea_orm_migration::MigratorTrait;
use std::path::Path;
use tracing::info;

/// SQLite-backed catalog. Also carries the management CRUD that sits
/// outside the core-facing [`Catalog`] trait.
#[derive(Clone)]
pub struct SqlCatalog {
    db: DatabaseConnection,
}

impl SqlCatalog {
    /// Connect to a database URL and run pending migrations.
    pub async fn connect(url: &str) -> Result<Self, CatalogError> {
        let db = Database::connect(url).await?;
        Migrator::up(&db, None).await?;
        Ok(Self { db })
    }

    /// Open (creating if necessary) the relay database under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, CatalogError> {
        let db_path = data_dir.join("burrow.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        info!("opening catalog at {}", db_path.display());
        Self::connect(&url).await
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    // ---- tunnels ----

    pub async fn create_tunnel(&self, name: &str) -> Result<Tunnel, CatalogError> {
        if TunnelEntity::find()
            .filter(tunnel::Column::Name.eq(name))
            .one(&self.db)
            .await?
            .is_some()
        {
            return Err(CatalogError::Duplicate {
                field: "name",
                value: name.to_string(),
            });
        }

        let now = Utc::now();
        let model = tunnel::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            name: Set(name.to_string()),
            token: Set(generate_token()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(&self.db).await?.into())
    }

    pub async fn get_tunnel(&self, id: &str) -> Result<Option<Tunnel>, CatalogError> {
        Ok(TunnelEntity::find_by_id(id).one(&self.db).await?.map(Into::into))
    }

    pub async fn list_tunnels(&self) -> Result<Vec<Tunnel>, CatalogError> {
        Ok(TunnelEntity::find()
            .order_by_asc(tunnel::Column::Name)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub async fn rename_tunnel(&self, id: &str, name: &str) -> Result<Tunnel, CatalogError> {
        let model = TunnelEntity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CatalogError::TunnelNotFound(id.to_string()))?;

        let mut active: tunnel::ActiveModel = model.into();
        active.name = Set(name.to_string());
        active.updated_at = Set(Utc::now());
        Ok(active.update(&self.db).await?.into())
    }

    /// Replace the tunnel's token; the old one stops working immediately.
    pub async fn rotate_token(&self, id: &str) -> Result<Tunnel, CatalogError> {
        let model = TunnelEntity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CatalogError::TunnelNotFound(id.to_string()))?;

        let mut active: tunnel::ActiveModel = model.into();
        active.token = Set(generate_token());
        active.updated_at = Set(Utc::now());
        Ok(active.update(&self.db).await?.into())
    }

    /// Delete a tunnel; its services and checks cascade away with it.
    pub async fn delete_tunnel(&self, id: &str) -> Result<(), CatalogError> {
        let result = TunnelEntity::delete_by_id(id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(CatalogError::TunnelNotFound(id.to_string()));
        }
        Ok(())
    }

    // ---- services ----

    pub async fn create_service(&self, new: NewService) -> Result<Service, CatalogError> {
        if TunnelEntity::find_by_id(new.tunnel_id.as_str())
            .one(&self.db)
            .await?
            .is_none()
        {
            return Err(CatalogError::TunnelNotFound(new.tunnel_id));
        }

        match new.kind {
            ServiceKind::Http => {
                let domain = new.domain.as_deref().unwrap_or("");
                if domain.is_empty() {
                    return Err(CatalogError::InvalidService(
                        "http service requires a domain".to_string(),
                    ));
                }
                if new.enabled && self.lookup_http_service(domain).await?.is_some() {
                    return Err(CatalogError::Duplicate {
                        field: "domain",
                        value: domain.to_string(),
                    });
                }
            }
            ServiceKind::Tcp => {
                let listen = new.listen_addr.as_deref().unwrap_or("");
                if listen.is_empty() {
                    return Err(CatalogError::InvalidService(
                        "tcp service requires a listen address".to_string(),
                    ));
                }
                let taken = ServiceEntity::find()
                    .filter(service::Column::ServiceType.eq(service::ServiceType::Tcp))
                    .filter(service::Column::ListenAddr.eq(listen))
                    .filter(service::Column::Enabled.eq(true))
                    .one(&self.db)
                    .await?
                    .is_some();
                if new.enabled && taken {
                    return Err(CatalogError::Duplicate {
                        field: "listen_addr",
                        value: listen.to_string(),
                    });
                }
            }
        }

        let model = service::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            tunnel_id: Set(new.tunnel_id),
            service_type: Set(new.kind.into()),
            domain: Set(new.domain),
            path_prefix: Set(new.path_prefix.unwrap_or_else(|| "/".to_string())),
            tls_mode: Set(new.tls_mode.into()),
            listen_addr: Set(new.listen_addr),
            target_addr: Set(new.target_addr),
            enabled: Set(new.enabled),
            created_at: Set(Utc::now()),
        };
        Ok(model.insert(&self.db).await?.into())
    }

    pub async fn get_service(&self, id: &str) -> Result<Option<Service>, CatalogError> {
        Ok(ServiceEntity::find_by_id(id).one(&self.db).await?.map(Into::into))
    }

    pub async fn list_services(&self, tunnel_id: &str) -> Result<Vec<Service>, CatalogError> {
        Ok(ServiceEntity::find()
            .filter(service::Column::TunnelId.eq(tunnel_id))
            .order_by_asc(service::Column::CreatedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub async fn update_service(&self, updated: &Service) -> Result<Service, CatalogError> {
        let model = ServiceEntity::find_by_id(updated.id.as_str())
            .one(&self.db)
            .await?
            .ok_or_else(|| CatalogError::ServiceNotFound(updated.id.clone()))?;

        let mut active: service::ActiveModel = model.into();
        active.domain = Set(updated.domain.clone());
        active.path_prefix = Set(updated.path_prefix.clone());
        active.tls_mode = Set(updated.tls_mode.into());
        active.listen_addr = Set(updated.listen_addr.clone());
        active.target_addr = Set(updated.target_addr.clone());
        active.enabled = Set(updated.enabled);
        Ok(active.update(&self.db).await?.into())
    }

    pub async fn delete_service(&self, id: &str) -> Result<(), CatalogError> {
        let result = ServiceEntity::delete_by_id(id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(CatalogError::ServiceNotFound(id.to_string()));
        }
        Ok(())
    }

    // ---- checks ----

    /// Recent ledger rows for a tunnel, newest first.
    pub async fn recent_checks(
        &self,
        tunnel_id: &str,
        limit: u64,
    ) -> Result<Vec<Check>, CatalogError> {
        Ok(CheckEntity::find()
            .filter(check::Column::TunnelId.eq(tunnel_id))
            .order_by_desc(check::Column::CreatedAt)
            .order_by_desc(check::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Uptime percentages over 24 h / 7 d / 30 d. Every sample counts.
    pub async fn uptime_stats(&self, tunnel_id: &str) -> Result<UptimeStats, CatalogError> {
        let now = Utc::now();

        let window = |since: DateTime<Utc>| {
            let db = self.db.clone();
            let tunnel_id = tunnel_id.to_string();
            async move {
                let total = CheckEntity::find()
                    .filter(check::Column::TunnelId.eq(&tunnel_id))
                    .filter(check::Column::CreatedAt.gte(since))
                    .count(&db)
                    .await?;
                if total == 0 {
                    return Ok::<f64, CatalogError>(0.0);
                }
                let up = CheckEntity::find()
                    .filter(check::Column::TunnelId.eq(&tunnel_id))
                    .filter(check::Column::CreatedAt.gte(since))
                    .filter(check::Column::Status.eq(check::CheckStatus::Up))
                    .count(&db)
                    .await?;
                Ok(up as f64 / total as f64 * 100.0)
            }
        };

        Ok(UptimeStats {
            uptime_24h: window(now - Duration::hours(24)).await?,
            uptime_7d: window(now - Duration::days(7)).await?,
            uptime_30d: window(now - Duration::days(30)).await?,
        })
    }
}

#[async_trait]
impl Catalog for SqlCatalog {
    async fn lookup_by_token(&self, token: &str) -> Result<Option<Tunnel>, CatalogError> {
        // Scan and compare every stored token in constant time rather than
        // asking SQLite to match, so lookup timing leaks nothing about
        // token prefixes.
        let tunnels = TunnelEntity::find().all(&self.db).await?;
        let mut found = None;
        for model in tunnels {
            if token_matches(token, &model.token) {
                found = Some(model.into());
            }
        }
        Ok(found)
    }

    async fn lookup_http_service(&self, domain: &str) -> Result<Option<Service>, CatalogError> {
        Ok(ServiceEntity::find()
            .filter(service::Column::ServiceType.eq(service::ServiceType::Http))
            .filter(service::Column::Domain.eq(domain))
            .filter(service::Column::Enabled.eq(true))
            .one(&self.db)
            .await?
            .map(Into::into))
    }

    async fn list_tcp_services(&self) -> Result<Vec<Service>, CatalogError> {
        Ok(ServiceEntity::find()
            .filter(service::Column::ServiceType.eq(service::ServiceType::Tcp))
            .filter(service::Column::Enabled.eq(true))
            .filter(service::Column::ListenAddr.is_not_null())
            .all(&self.db)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn append_check(&self, new: NewCheck) -> Result<(), CatalogError> {
        let model = check::ActiveModel {
            id: sea_orm::ActiveValue::NotSet,
            tunnel_id: Set(new.tunnel_id),
            status: Set(new.status.into()),
            latency_ms: Set(new.latency_ms),
            error: Set(new.error),
            created_at: Set(Utc::now()),
        };
        model.insert(&self.db).await?;
        Ok(())
    }

    async fn trim_checks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CatalogError> {
        let result = CheckEntity::delete_many()
            .filter(check::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

// ---- entity <-> domain conversions ----

impl From<tunnel::Model> for Tunnel {
    fn from(m: tunnel::Model) -> Self {
        Tunnel {
            id: m.id,
            name: m.name,
            token: m.token,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

impl From<service::Model> for Service {
    fn from(m: service::Model) -> Self {
        Service {
            id: m.id,
            tunnel_id: m.tunnel_id,
            kind: m.service_type.into(),
            domain: m.domain,
            path_prefix: m.path_prefix,
            tls_mode: m.tls_mode.into(),
            listen_addr: m.listen_addr,
            target_addr: m.target_addr,
            enabled: m.enabled,
            created_at: m.created_at,
        }
    }
}

impl From<check::Model> for Check {
    fn from(m: check::Model) -> Self {
        Check {
            id: m.id,
            tunnel_id: m.tunnel_id,
            status: m.status.into(),
            latency_ms: m.latency_ms,
            error: m.error,
            created_at: m.created_at,
        }
    }
}

impl From<service::ServiceType> for ServiceKind {
    fn from(t: service::ServiceType) -> Self {
        match t {
            service::ServiceType::Http => ServiceKind::Http,
            service::ServiceType::Tcp => ServiceKind::Tcp,
        }
    }
}

impl From<ServiceKind> for service::ServiceType {
    fn from(k: ServiceKind) -> Self {
        match k {
            ServiceKind::Http => service::ServiceType::Http,
            ServiceKind::Tcp => service::ServiceType::Tcp,
        }
    }
}

impl From<service::TlsMode> for TlsMode {
    fn from(t: service::TlsMode) -> Self {
        match t {
            service::TlsMode::Terminate => TlsMode::Terminate,
            service::TlsMode::Passthrough => TlsMode::Passthrough,
        }
    }
}

impl From<TlsMode> for service::TlsMode {
    fn from(t: TlsMode) -> Self {
        match t {
            TlsMode::Terminate => service::TlsMode::Terminate,
            TlsMode::Passthrough => service::TlsMode::Passthrough,
        }
    }
}

impl From<check::CheckStatus> for CheckStatus {
    fn from(s: check::CheckStatus) -> Self {
        match s {
            check::CheckStatus::Up => CheckStatus::Up,
            check::CheckStatus::Down => CheckStatus::Down,
        }
    }
}

impl From<CheckStatus> for check::CheckStatus {
    fn from(s: CheckStatus) -> Self {
        match s {
            CheckStatus::Up => check::CheckStatus::Up,
            CheckStatus::Down => check::CheckStatus::Down,
        }
    }
}
