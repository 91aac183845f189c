use thiserror::Error;

use crate::ids::ServerId;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // --- Caller errors (4xx at the ingress) ---
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    // --- Dispatch errors (recoverable via retry on another server) ---
    #[error("No available servers")]
    NoAvailableServers,

    #[error("Server {0} is unavailable")]
    ServerUnavailable(ServerId),

    #[error("Server {0} is at capacity")]
    AtCapacity(ServerId),

    #[error("Backend error: {0}")]
    Backend(String),

    // --- Operational errors ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether a retry on a different server could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerUnavailable(_) | Self::AtCapacity(_) | Self::Backend(_)
        )
    }

    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "auth",
            Self::Forbidden(_) => "forbidden",
            Self::IllegalTransition(_) => "illegal_transition",
            Self::NoAvailableServers => "no_available_servers",
            Self::ServerUnavailable(_) => "server_unavailable",
            Self::AtCapacity(_) => "at_capacity",
            Self::Backend(_) => "backend",
            Self::Serialization(_) => "serialization",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
