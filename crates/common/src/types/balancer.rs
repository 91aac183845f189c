use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::TaskRequest;

/// Server-selection algorithms. Dispatch is a match, not a trait object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    ResponseTime,
    Random,
}

impl BalancerAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::LeastConnections => "least-connections",
            Self::ResponseTime => "response-time",
            Self::Random => "random",
        }
    }
}

impl FromStr for BalancerAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "weighted-round-robin" => Ok(Self::WeightedRoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "response-time" => Ok(Self::ResponseTime),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown balancing algorithm: {}", other)),
        }
    }
}

/// What a task needs from the server that will run it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl From<&TaskRequest> for SelectionCriteria {
    fn from(request: &TaskRequest) -> Self {
        Self {
            task_type: Some(request.task_type.clone()),
            priority: Some(request.priority),
            required_capabilities: request.required_capabilities.clone(),
        }
    }
}
