use super::ClientConfig;
use crate::utils::connection_url::validate_base_url;

/// Validate a merged configuration.
pub(crate) fn validate_config(config: &ClientConfig) -> Result<(), String> {
    validate_base_url(&config.base_url)
        .map_err(|e| format!("Invalid base URL '{}': {e}", config.base_url))?;

    if config.input_sample_rate == 0 {
        return Err("Input sample rate must be greater than zero".to_string());
    }
    if config.output_sample_rate == 0 {
        return Err("Output sample rate must be greater than zero".to_string());
    }
    if config.connect_timeout_ms == 0 {
        return Err("Connect timeout must be greater than zero".to_string());
    }

    if !config.volume.is_finite() {
        return Err("Volume must be a finite number".to_string());
    }

    validate_reconnection(config)
}

fn validate_reconnection(config: &ClientConfig) -> Result<(), String> {
    let policy = &config.reconnection;

    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(format!(
            "Backoff multiplier must be at least 1.0, got {}",
            policy.backoff_multiplier
        ));
    }
    if policy.max_delay_ms < policy.initial_delay_ms {
        return Err(format!(
            "Max reconnect delay ({}ms) must not be below the initial delay ({}ms)",
            policy.max_delay_ms, policy.initial_delay_ms
        ));
    }

    Ok(())
}
