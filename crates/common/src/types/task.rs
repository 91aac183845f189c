use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ServerId, TaskId};

/// Task lifecycle states.
///
/// Terminal states are immutable; the only path out of FAILED or TIMEOUT is
/// an explicit retry, which rewinds to PENDING and records the prior attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

fn default_async() -> bool {
    true
}

/// The work request carried by a task. The payload is opaque to the gateway
/// and forwarded to the backend worker verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: u8,
    pub payload: Value,
    /// Capability tags the selected server must supply.
    #[serde(default, rename = "capabilities")]
    pub required_capabilities: Vec<String>,
    /// false = the caller blocks until the task reaches a terminal state.
    #[serde(rename = "async", default = "default_async")]
    pub is_async: bool,
}

/// One prior dispatch attempt, recorded when a task is retried.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub previous_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_error: Option<String>,
}

/// A task record owned by exactly one TaskInstance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub request: TaskRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0–100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Prior attempts, oldest first. Length equals the retry counter.
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
}

impl Task {
    pub fn new(id: TaskId, request: TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            request,
            server_id: None,
            result: None,
            error: None,
            progress: 0,
            created_at: now,
            updated_at: now,
            attempts: Vec::new(),
        }
    }
}

/// Partial update applied to a PROCESSING task, either by a worker callback
/// or by the synchronous dispatch path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
