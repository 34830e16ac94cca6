use std::env;
use std::str::FromStr;

use super::ClientConfig;
use crate::core::audio::VoiceMode;

/// Read an environment variable, treating empty values as unset.
pub(crate) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable into `T`.
pub(crate) fn parse_env<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: {e}")),
        None => Ok(None),
    }
}

/// Parse a boolean flag. Accepts true/false, 1/0, yes/no, on/off.
pub(crate) fn parse_bool_env(name: &str) -> Result<Option<bool>, String> {
    let Some(raw) = env_var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        other => Err(format!("Invalid boolean for {name}: {other}")),
    }
}

/// Build a configuration from `VOICE_*` environment variables over defaults.
pub(crate) fn load_from_env() -> Result<ClientConfig, String> {
    let mut config = ClientConfig::default();

    if let Some(url) = env_var("VOICE_BASE_URL") {
        config.base_url = url;
    }
    config.auth_token = env_var("VOICE_AUTH_TOKEN");
    config.session_id = env_var("VOICE_SESSION_ID");

    if let Some(ms) = parse_env::<u64>("VOICE_CONNECT_TIMEOUT_MS")? {
        config.connect_timeout_ms = ms;
    }
    if let Some(ms) = parse_env::<u64>("VOICE_HEARTBEAT_INTERVAL_MS")? {
        config.heartbeat_interval_ms = ms;
    }

    if let Some(enabled) = parse_bool_env("VOICE_AUTO_RECONNECT")? {
        config.reconnection.enabled = enabled;
    }
    if let Some(attempts) = parse_env::<u32>("VOICE_RECONNECT_MAX_ATTEMPTS")? {
        config.reconnection.max_attempts = attempts;
    }
    if let Some(ms) = parse_env::<u64>("VOICE_RECONNECT_INITIAL_DELAY_MS")? {
        config.reconnection.initial_delay_ms = ms;
    }
    if let Some(ms) = parse_env::<u64>("VOICE_RECONNECT_MAX_DELAY_MS")? {
        config.reconnection.max_delay_ms = ms;
    }
    if let Some(multiplier) = parse_env::<f32>("VOICE_RECONNECT_BACKOFF")? {
        config.reconnection.backoff_multiplier = multiplier;
    }

    if let Some(rate) = parse_env::<u32>("VOICE_INPUT_SAMPLE_RATE")? {
        config.input_sample_rate = rate;
    }
    if let Some(rate) = parse_env::<u32>("VOICE_OUTPUT_SAMPLE_RATE")? {
        config.output_sample_rate = rate;
    }
    if let Some(respect) = parse_bool_env("VOICE_RESPECT_TURN_STATE")? {
        config.respect_turn_state = respect;
    }
    if let Some(user_first) = parse_bool_env("VOICE_USER_STARTS_WITH_TURN")? {
        config.user_starts_with_turn = user_first;
    }
    if let Some(mode) = parse_env::<VoiceMode>("VOICE_MODE")? {
        config.voice_mode = mode;
    }

    Ok(config)
}
