use serde::{Deserialize, Serialize};

use crate::types::BalancerAlgorithm;

/// Top-level gateway configuration, deserialized from gateway.toml and then
/// overridden by environment variables (see the gateway's config loader).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL synthesized into worker callback URLs; required.
    #[serde(default)]
    pub worker_url: String,
    /// Shared HS256 secret for bearer-token validation; required.
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_listen_port() -> u16 {
    8080
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            worker_url: String::new(),
            jwt_secret: String::new(),
            listen_port: default_listen_port(),
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
            task: TaskConfig::default(),
            balancer: BalancerConfig::default(),
            stats: StatsConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Fleet-membership parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Milliseconds of heartbeat silence after which a server is offline.
    pub stale_threshold_ms: u64,
    /// Cadence of the stale-server sweep.
    pub cleanup_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Adaptive health-check loop bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    pub min_check_interval_ms: u64,
    pub max_check_interval_ms: u64,
    /// Interval assigned to a freshly initialized server.
    pub initial_check_interval_ms: u64,
    /// Idle time after which a drained server shuts itself down.
    pub max_idle_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_check_interval_ms: 5_000,
            max_check_interval_ms: 60_000,
            initial_check_interval_ms: 10_000,
            max_idle_ms: 3_600_000,
        }
    }
}

/// Task lifecycle parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Maximum PROCESSING duration before the timeout timer fires.
    pub timeout_ms: u64,
    /// Retention after a terminal transition, before storage is purged.
    pub cleanup_delay_ms: u64,
    pub max_retries: u32,
    /// How long a synchronous createTask call waits for a terminal state.
    pub sync_wait_ms: u64,
    pub sync_poll_interval_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_600_000,
            cleanup_delay_ms: 300_000,
            max_retries: 3,
            sync_wait_ms: 30_000,
            sync_poll_interval_ms: 100,
        }
    }
}

/// Load-balancer parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub rebalance_interval_ms: u64,
    pub default_algorithm: BalancerAlgorithm,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_ms: 30_000,
            default_algorithm: BalancerAlgorithm::RoundRobin,
        }
    }
}

/// Statistics aggregation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsConfig {
    pub flush_interval_ms: u64,
    /// Buffer size that forces an immediate flush.
    pub flush_buffer_limit: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 10_000,
            flush_buffer_limit: 1_000,
        }
    }
}

/// Outbound HTTP timeouts and shutdown drain bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    pub predict_timeout_ms: u64,
    pub health_timeout_ms: u64,
    /// How long shutdown waits for active dispatches to drain.
    pub shutdown_drain_ms: u64,
    pub shutdown_poll_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            predict_timeout_ms: 30_000,
            health_timeout_ms: 5_000,
            shutdown_drain_ms: 30_000,
            shutdown_poll_ms: 1_000,
        }
    }
}
