use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override the environment.
///
/// # Example YAML structure
/// ```yaml
/// connection:
///   base_url: "wss://voice.example.com/ws"
///   auth_token: "your-token"
///   session_id: "resume-me"
///   connect_timeout_ms: 10000
///   heartbeat_interval_ms: 30000
///
/// reconnection:
///   enabled: true
///   max_attempts: 5
///   initial_delay_ms: 1000
///   max_delay_ms: 30000
///   backoff_multiplier: 2.0
///   jitter: true
///
/// audio:
///   input_sample_rate: 16000
///   output_sample_rate: 24000
///   respect_turn_state: true
///   user_starts_with_turn: false
///   voice_mode: "normal"
///   volume: 0.8
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub connection: Option<ConnectionYaml>,
    pub reconnection: Option<ReconnectionYaml>,
    pub audio: Option<AudioYaml>,
}

/// Connection settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionYaml {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub session_id: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    /// Zero disables the heartbeat.
    pub heartbeat_interval_ms: Option<u64>,
}

/// Reconnection policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f32>,
    pub jitter: Option<bool>,
}

/// Audio settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub respect_turn_state: Option<bool>,
    pub user_starts_with_turn: Option<bool>,
    /// `normal`, `avatar_rendered` or `text_only`.
    pub voice_mode: Option<String>,
    pub volume: Option<f32>,
}

impl YamlConfig {
    /// Load and parse a YAML configuration file.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
