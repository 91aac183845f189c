use taskgate_common::config::GatewayConfig;

use super::loader::ConfigError;

/// Validate the complete gateway configuration.
///
/// Checks required fields and sane ranges. The gateway refuses to start on
/// validation failure.
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if config.worker_url.is_empty() {
        errors.push("worker_url (WORKER_URL) is required".into());
    }
    if config.jwt_secret.is_empty() {
        errors.push("jwt_secret (JWT_SECRET) is required".into());
    }

    validate_registry(config, &mut errors);
    validate_health(config, &mut errors);
    validate_task(config, &mut errors);
    validate_loops(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_registry(config: &GatewayConfig, errors: &mut Vec<String>) {
    let r = &config.registry;

    if r.stale_threshold_ms == 0 {
        errors.push("registry.stale_threshold_ms must be > 0".into());
    }
    if r.cleanup_interval_ms == 0 {
        errors.push("registry.cleanup_interval_ms must be > 0".into());
    }
}

fn validate_health(config: &GatewayConfig, errors: &mut Vec<String>) {
    let h = &config.health;

    if h.min_check_interval_ms == 0 {
        errors.push("health.min_check_interval_ms must be > 0".into());
    }
    if h.max_check_interval_ms < h.min_check_interval_ms {
        errors.push("health.max_check_interval_ms must be >= min_check_interval_ms".into());
    }
    if !(h.min_check_interval_ms..=h.max_check_interval_ms)
        .contains(&h.initial_check_interval_ms)
    {
        errors.push("health.initial_check_interval_ms must lie within the min/max bounds".into());
    }
    if h.max_idle_ms == 0 {
        errors.push("health.max_idle_ms must be > 0".into());
    }
}

fn validate_task(config: &GatewayConfig, errors: &mut Vec<String>) {
    let t = &config.task;

    if t.timeout_ms == 0 {
        errors.push("task.timeout_ms must be > 0".into());
    }
    if t.cleanup_delay_ms == 0 {
        errors.push("task.cleanup_delay_ms must be > 0".into());
    }
    if t.max_retries == 0 {
        errors.push("task.max_retries must be >= 1".into());
    }
    if t.sync_poll_interval_ms == 0 || t.sync_poll_interval_ms > t.sync_wait_ms {
        errors.push("task.sync_poll_interval_ms must be > 0 and <= sync_wait_ms".into());
    }
}

fn validate_loops(config: &GatewayConfig, errors: &mut Vec<String>) {
    if config.balancer.rebalance_interval_ms == 0 {
        errors.push("balancer.rebalance_interval_ms must be > 0".into());
    }
    if config.stats.flush_interval_ms == 0 {
        errors.push("stats.flush_interval_ms must be > 0".into());
    }
    if config.stats.flush_buffer_limit == 0 {
        errors.push("stats.flush_buffer_limit must be > 0".into());
    }
    if config.http.predict_timeout_ms == 0 || config.http.health_timeout_ms == 0 {
        errors.push("http timeouts must be > 0".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            worker_url: "http://gateway.local".into(),
            jwt_secret: "secret".into(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn default_config_with_required_fields_passes() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn missing_required_fields_fail() {
        let config = GatewayConfig::default();
        let err = validate(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("worker_url"));
        assert!(msg.contains("jwt_secret"));
    }

    #[test]
    fn inverted_health_bounds_fail() {
        let mut config = base_config();
        config.health.min_check_interval_ms = 60_000;
        config.health.max_check_interval_ms = 5_000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_retries_fail() {
        let mut config = base_config();
        config.task.max_retries = 0;
        assert!(validate(&config).is_err());
    }
}
