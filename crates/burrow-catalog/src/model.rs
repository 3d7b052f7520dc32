//! Domain model shared by all catalog implementations.

use burrow_proto::ServiceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical tunnel endpoint: the unit of authentication and ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How the HTTPS ingress treats TLS for an HTTP service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Decrypt at the relay, forward plain HTTP down the tunnel.
    Terminate,
    /// Forward the raw TLS bytes down the tunnel untouched.
    Passthrough,
}

/// A public ingress rule attached to a tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub tunnel_id: String,
    pub kind: ServiceKind,
    /// HTTP services: the public domain this service answers for.
    pub domain: Option<String>,
    /// HTTP services: required path prefix, `/` for all paths.
    pub path_prefix: String,
    pub tls_mode: TlsMode,
    /// TCP services: the relay-side address to listen on.
    pub listen_addr: Option<String>,
    /// Address the agent dials locally.
    pub target_addr: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a service.
#[derive(Debug, Clone)]
pub struct NewService {
    pub tunnel_id: String,
    pub kind: ServiceKind,
    pub domain: Option<String>,
    pub path_prefix: Option<String>,
    pub tls_mode: TlsMode,
    pub listen_addr: Option<String>,
    pub target_addr: String,
    pub enabled: bool,
}

/// Availability at a moment in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

/// One immutable row of the uptime ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: i64,
    pub tunnel_id: String,
    pub status: CheckStatus,
    pub latency_ms: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A check row about to be appended.
#[derive(Debug, Clone)]
pub struct NewCheck {
    pub tunnel_id: String,
    pub status: CheckStatus,
    pub latency_ms: Option<i32>,
    pub error: Option<String>,
}

impl NewCheck {
    pub fn up(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            status: CheckStatus::Up,
            latency_ms: None,
            error: None,
        }
    }

    pub fn up_with_latency(tunnel_id: impl Into<String>, latency_ms: i32) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            status: CheckStatus::Up,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn down(tunnel_id: impl Into<String>, error: Option<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            status: CheckStatus::Down,
            latency_ms: None,
            error,
        }
    }
}

/// Uptime percentages over rolling windows. Every recorded sample in the
/// window counts, probe samples included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UptimeStats {
    pub uptime_24h: f64,
    pub uptime_7d: f64,
    pub uptime_30d: f64,
}
