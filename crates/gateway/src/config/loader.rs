use std::path::{Path, PathBuf};

use taskgate_common::config::GatewayConfig;

use super::validation;

/// Load the gateway configuration.
///
/// Reads an optional `gateway.toml` from the config directory, then applies
/// environment overrides, then validates. The gateway refuses to start on
/// validation failure.
pub fn load_config(config_dir: &Path) -> Result<GatewayConfig, ConfigError> {
    tracing::info!(config_dir = %config_dir.display(), "Loading configuration");

    let mut config = load_file_config(&config_dir.join("gateway.toml"))?;
    apply_env_overrides(&mut config)?;
    validation::validate(&config)?;

    tracing::info!(
        listen_port = config.listen_port,
        algorithm = config.balancer.default_algorithm.as_str(),
        "Configuration loaded successfully"
    );

    Ok(config)
}

fn load_file_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, starting from defaults");
        return Ok(GatewayConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Environment variables override file values. Durations are milliseconds.
fn apply_env_overrides(config: &mut GatewayConfig) -> Result<(), ConfigError> {
    if let Ok(url) = std::env::var("WORKER_URL") {
        config.worker_url = url;
    }
    if let Ok(secret) = std::env::var("JWT_SECRET") {
        config.jwt_secret = secret;
    }

    set_parsed(&mut config.listen_port, "TASKGATE_PORT")?;
    set_parsed(
        &mut config.registry.stale_threshold_ms,
        "SERVER_STALE_THRESHOLD",
    )?;
    set_parsed(
        &mut config.registry.cleanup_interval_ms,
        "SERVER_CLEANUP_INTERVAL",
    )?;
    set_parsed(
        &mut config.health.min_check_interval_ms,
        "MIN_HEALTH_CHECK_INTERVAL",
    )?;
    set_parsed(
        &mut config.health.max_check_interval_ms,
        "MAX_HEALTH_CHECK_INTERVAL",
    )?;
    set_parsed(&mut config.task.timeout_ms, "TASK_TIMEOUT")?;
    set_parsed(&mut config.task.cleanup_delay_ms, "CLEANUP_DELAY")?;
    set_parsed(&mut config.task.max_retries, "MAX_RETRIES")?;

    Ok(())
}

fn set_parsed<T: std::str::FromStr>(target: &mut T, var: &str) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(var) {
        *target = raw.parse().map_err(|_| ConfigError::Env {
            var: var.to_string(),
            value: raw,
        })?;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
