use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ServerId, TaskId};
use crate::types::{Task, TaskRequest, TaskStatus};

/// POST /api/task request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(rename = "async", default, skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,
}

impl CreateTaskRequest {
    /// Normalize into the internal request, applying defaults.
    pub fn into_request(self) -> TaskRequest {
        TaskRequest {
            task_type: self.task_type,
            priority: self.priority.unwrap_or(0),
            payload: self.payload,
            required_capabilities: self.capabilities.unwrap_or_default(),
            is_async: self.is_async.unwrap_or(true),
        }
    }
}

/// Task projection returned by the task endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: u8,
    /// Number of prior attempts; equals the retry counter.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            server_id: task.server_id.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            progress: task.progress,
            attempts: task.attempts.len() as u32,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// Result of retry/cancel actions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}
