use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ServerId, TaskId};

/// Buffered statistics event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsEventKind {
    Start,
    Complete,
}

/// One buffered lifecycle event, flushed to storage in batches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEvent {
    pub kind: StatsEventKind,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    pub success: bool,
    pub duration_ms: u64,
    pub retries: u32,
    pub timestamp: DateTime<Utc>,
}

/// Day-level aggregate counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounters {
    pub total_tasks: u64,
    pub pending_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub retried_tasks: u64,
    pub total_success_duration_ms: u64,
    pub average_processing_time_ms: f64,
}

/// Per-server rollup for one calendar day.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatistics {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_duration_ms: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

/// One hour bucket of the daily trend, labeled "H:00-H:59".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    pub period: String,
    pub tasks: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Leaderboard entry in the day statistics response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopServerEntry {
    pub server_id: ServerId,
    pub tasks_processed: u64,
    pub success_rate: f64,
}

/// Full day statistics, as returned by GET /api/stats.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub date: String,
    #[serde(flatten)]
    pub counters: TaskCounters,
    pub top_servers: Vec<TopServerEntry>,
    pub hourly_trend: Vec<HourlyBucket>,
}
