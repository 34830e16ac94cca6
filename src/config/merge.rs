use super::ClientConfig;
use super::yaml::YamlConfig;
use crate::core::audio::VoiceMode;

/// Apply YAML values on top of an environment-derived configuration.
///
/// Only keys present in the file are applied.
pub(crate) fn apply_yaml(config: &mut ClientConfig, yaml: YamlConfig) -> Result<(), String> {
    if let Some(connection) = yaml.connection {
        if let Some(url) = connection.base_url {
            config.base_url = url;
        }
        if let Some(token) = connection.auth_token {
            config.auth_token = Some(token);
        }
        if let Some(session) = connection.session_id {
            config.session_id = Some(session);
        }
        if let Some(ms) = connection.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = connection.heartbeat_interval_ms {
            config.heartbeat_interval_ms = ms;
        }
    }

    if let Some(reconnection) = yaml.reconnection {
        let policy = &mut config.reconnection;
        if let Some(enabled) = reconnection.enabled {
            policy.enabled = enabled;
        }
        if let Some(attempts) = reconnection.max_attempts {
            policy.max_attempts = attempts;
        }
        if let Some(ms) = reconnection.initial_delay_ms {
            policy.initial_delay_ms = ms;
        }
        if let Some(ms) = reconnection.max_delay_ms {
            policy.max_delay_ms = ms;
        }
        if let Some(multiplier) = reconnection.backoff_multiplier {
            policy.backoff_multiplier = multiplier;
        }
        if let Some(jitter) = reconnection.jitter {
            policy.jitter = jitter;
        }
    }

    if let Some(audio) = yaml.audio {
        if let Some(rate) = audio.input_sample_rate {
            config.input_sample_rate = rate;
        }
        if let Some(rate) = audio.output_sample_rate {
            config.output_sample_rate = rate;
        }
        if let Some(respect) = audio.respect_turn_state {
            config.respect_turn_state = respect;
        }
        if let Some(user_first) = audio.user_starts_with_turn {
            config.user_starts_with_turn = user_first;
        }
        if let Some(mode) = audio.voice_mode {
            config.voice_mode = mode.parse::<VoiceMode>()?;
        }
        if let Some(volume) = audio.volume {
            config.volume = volume.clamp(0.0, 1.0);
        }
    }

    Ok(())
}
