use serde::{Deserialize, Serialize};

use crate::ids::ServerId;
use crate::types::{ServerConfig, ServerEndpoints, ServerInfo};

/// POST /api/servers request body. The id is optional; the registry
/// generates one when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ServerId>,
    pub name: String,
    pub endpoints: ServerEndpoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_concurrent: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub priority: u8,
}

impl RegisterServerRequest {
    /// Resolve into a registration config under the given id.
    pub fn into_config(self, id: ServerId) -> ServerConfig {
        ServerConfig {
            id,
            name: self.name,
            endpoints: self.endpoints,
            api_key: self.api_key,
            max_concurrent: self.max_concurrent,
            capabilities: self.capabilities,
            groups: self.groups,
            priority: self.priority,
        }
    }
}

/// POST /api/servers response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerResponse {
    pub server_id: ServerId,
    pub message: String,
}

/// GET /api/servers query parameters.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// GET /api/servers response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerInfo>,
}

/// PUT /api/servers/{id}/maintenance request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

/// Bare success acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}
