//! In-memory catalog. All data is lost on restart; intended for tests and
//! embedded setups.

use crate::model::{Check, NewCheck, NewService, Service, Tunnel, UptimeStats};
use crate::{generate_token, token_matches, Catalog, CatalogError};
use async_trait::async_trait;
use burrow_proto::ServiceKind;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Inner {
    tunnels: HashMap<String, Tunnel>,
    services: HashMap<String, Service>,
    checks: Vec<Check>,
    next_check_id: i64,
}

/// The default in-memory implementation of [`Catalog`].
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tunnel with a freshly minted token.
    pub fn create_tunnel(&self, name: impl Into<String>) -> Result<Tunnel, CatalogError> {
        let name = name.into();
        let mut inner = self.inner.write().unwrap();

        if inner.tunnels.values().any(|t| t.name == name) {
            return Err(CatalogError::Duplicate {
                field: "name",
                value: name,
            });
        }

        let now = Utc::now();
        let tunnel = Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            token: generate_token(),
            created_at: now,
            updated_at: now,
        };
        inner.tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(tunnel)
    }

    pub fn get_tunnel(&self, id: &str) -> Option<Tunnel> {
        self.inner.read().unwrap().tunnels.get(id).cloned()
    }

    /// Create a service, enforcing the ingress uniqueness rules.
    pub fn create_service(&self, new: NewService) -> Result<Service, CatalogError> {
        let mut inner = self.inner.write().unwrap();

        if !inner.tunnels.contains_key(&new.tunnel_id) {
            return Err(CatalogError::TunnelNotFound(new.tunnel_id));
        }
        validate_service(&new)?;

        if new.enabled {
            for existing in inner.services.values().filter(|s| s.enabled) {
                if new.kind == ServiceKind::Http && existing.domain == new.domain {
                    return Err(CatalogError::Duplicate {
                        field: "domain",
                        value: new.domain.unwrap_or_default(),
                    });
                }
                if new.kind == ServiceKind::Tcp
                    && existing.listen_addr.is_some()
                    && existing.listen_addr == new.listen_addr
                {
                    return Err(CatalogError::Duplicate {
                        field: "listen_addr",
                        value: new.listen_addr.unwrap_or_default(),
                    });
                }
            }
        }

        let service = Service {
            id: uuid::Uuid::new_v4().to_string(),
            tunnel_id: new.tunnel_id,
            kind: new.kind,
            domain: new.domain,
            path_prefix: new.path_prefix.unwrap_or_else(|| "/".to_string()),
            tls_mode: new.tls_mode,
            listen_addr: new.listen_addr,
            target_addr: new.target_addr,
            enabled: new.enabled,
            created_at: Utc::now(),
        };
        inner.services.insert(service.id.clone(), service.clone());
        Ok(service)
    }

    pub fn delete_service(&self, id: &str) -> Option<Service> {
        self.inner.write().unwrap().services.remove(id)
    }

    /// All checks for a tunnel, newest first.
    pub fn checks_for(&self, tunnel_id: &str) -> Vec<Check> {
        let inner = self.inner.read().unwrap();
        let mut checks: Vec<Check> = inner
            .checks
            .iter()
            .filter(|c| c.tunnel_id == tunnel_id)
            .cloned()
            .collect();
        checks.sort_by_key(|c| std::cmp::Reverse((c.created_at, c.id)));
        checks
    }

    pub fn uptime_stats(&self, tunnel_id: &str) -> UptimeStats {
        let inner = self.inner.read().unwrap();
        let now = Utc::now();

        let window = |hours: i64| -> f64 {
            let since = now - Duration::hours(hours);
            let samples: Vec<_> = inner
                .checks
                .iter()
                .filter(|c| c.tunnel_id == tunnel_id && c.created_at >= since)
                .collect();
            if samples.is_empty() {
                return 0.0;
            }
            let up = samples
                .iter()
                .filter(|c| c.status == crate::CheckStatus::Up)
                .count();
            up as f64 / samples.len() as f64 * 100.0
        };

        UptimeStats {
            uptime_24h: window(24),
            uptime_7d: window(24 * 7),
            uptime_30d: window(24 * 30),
        }
    }
}

fn validate_service(new: &NewService) -> Result<(), CatalogError> {
    match new.kind {
        ServiceKind::Http if new.domain.as_deref().unwrap_or("").is_empty() => Err(
            CatalogError::InvalidService("http service requires a domain".to_string()),
        ),
        ServiceKind::Tcp if new.listen_addr.as_deref().unwrap_or("").is_empty() => Err(
            CatalogError::InvalidService("tcp service requires a listen address".to_string()),
        ),
        _ => Ok(()),
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn lookup_by_token(&self, token: &str) -> Result<Option<Tunnel>, CatalogError> {
        let inner = self.inner.read().unwrap();
        // Compare against every stored token so timing is independent of
        // which (if any) tunnel matches.
        let mut found = None;
        for tunnel in inner.tunnels.values() {
            if token_matches(token, &tunnel.token) {
                found = Some(tunnel.clone());
            }
        }
        Ok(found)
    }

    async fn lookup_http_service(&self, domain: &str) -> Result<Option<Service>, CatalogError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .services
            .values()
            .find(|s| {
                s.enabled && s.kind == ServiceKind::Http && s.domain.as_deref() == Some(domain)
            })
            .cloned())
    }

    async fn list_tcp_services(&self) -> Result<Vec<Service>, CatalogError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .services
            .values()
            .filter(|s| s.enabled && s.kind == ServiceKind::Tcp && s.listen_addr.is_some())
            .cloned()
            .collect())
    }

    async fn append_check(&self, check: NewCheck) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().unwrap();
        inner.next_check_id += 1;
        let id = inner.next_check_id;
        inner.checks.push(Check {
            id,
            tunnel_id: check.tunnel_id,
            status: check.status,
            latency_ms: check.latency_ms,
            error: check.error,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn trim_checks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CatalogError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.checks.len();
        inner.checks.retain(|c| c.created_at >= cutoff);
        Ok((before - inner.checks.len()) as u64)
    }
}
