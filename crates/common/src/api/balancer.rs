use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ServerId;
use crate::types::BalancerAlgorithm;

/// GET /api/loadbalancer/status response. Exposes the real cached state,
/// not placeholders.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerStatus {
    pub algorithm: BalancerAlgorithm,
    pub healthy_servers: Vec<ServerId>,
    pub server_loads: BTreeMap<String, u32>,
}

/// PUT /api/loadbalancer/algorithm request body. The algorithm arrives as a
/// plain string so unknown names surface as a validation error, not a
/// deserialization failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetAlgorithmRequest {
    pub algorithm: String,
}
