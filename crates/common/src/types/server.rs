use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ServerId;

/// Fleet-visible server states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Initializing,
    Online,
    Degraded,
    Offline,
    Maintenance,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("unknown server status: {}", other)),
        }
    }
}

/// HTTP endpoints exposed by a backend worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerEndpoints {
    pub predict: String,
    pub health: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
}

/// Immutable registration record for one backend worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    pub endpoints: ServerEndpoints,
    /// Sent as a bearer header on predict calls when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Dispatch ceiling, >= 1.
    pub max_concurrent: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// 0–10.
    #[serde(default)]
    pub priority: u8,
}

/// Registry view of a server, with derived freshness fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(flatten)]
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub uptime_ms: u64,
    pub time_since_last_heartbeat_ms: u64,
}

/// Filter applied to registry listings.
#[derive(Clone, Debug, Default)]
pub struct ServerFilter {
    pub status: Option<ServerStatus>,
    pub group: Option<String>,
    /// Only servers heard from within this many milliseconds.
    pub max_age_ms: Option<u64>,
}

impl ServerFilter {
    pub fn online() -> Self {
        Self {
            status: Some(ServerStatus::Online),
            ..Self::default()
        }
    }
}

/// Runtime metrics snapshot for one server. Doubles as the payload a
/// ServerInstance pushes to the LoadBalancer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// 0.0–1.0; 1.0 when nothing has been processed yet.
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub health_score: u8,
    pub active_tasks: u32,
    pub status: ServerStatus,
    pub healthy: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent: u32,
    /// Set on the push that follows a finished dispatch; tells the balancer
    /// to decrement its in-flight counter.
    #[serde(default)]
    pub task_completed: bool,
}
