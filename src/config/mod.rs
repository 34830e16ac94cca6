//! Configuration module for the voice client
//!
//! Configuration comes from environment variables (after `.env` is loaded by
//! the binary) and an optional YAML file. Priority: YAML > ENV vars > .env
//! values > defaults. The merged result is validated before use.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides to the environment base
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use waav_voice_client::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ClientConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config_path = PathBuf::from("config.yaml");
//! let config = ClientConfig::from_file(&config_path)?;
//!
//! println!("Connecting to {}", config.base_url);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::{AudioYaml, ConnectionYaml, ReconnectionYaml, YamlConfig};

use crate::core::audio::{
    DEFAULT_SCHEDULE_AHEAD_SECONDS, EgressConfig, PLAYBACK_OVERLAP_SECONDS, VoiceMode,
};
use crate::core::realtime::RealtimeClientConfig;
use crate::core::reconnection::ReconnectionPolicy;

/// Client configuration
///
/// Everything needed to compose a realtime client with its audio bridges:
/// - Connection settings (base URL, credentials, timeouts)
/// - Reconnection policy
/// - Audio formats, turn gating and playback mode
#[derive(Clone)]
pub struct ClientConfig {
    // Connection settings
    pub base_url: String,
    pub auth_token: Option<String>,
    pub session_id: Option<String>,
    pub connect_timeout_ms: u64,
    /// Zero disables the heartbeat.
    pub heartbeat_interval_ms: u64,

    // Reconnection
    pub reconnection: ReconnectionPolicy,

    // Audio settings
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub respect_turn_state: bool,
    pub user_starts_with_turn: bool,
    pub voice_mode: VoiceMode,
    pub volume: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:3001/ws".to_string(),
            auth_token: None,
            session_id: None,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            reconnection: ReconnectionPolicy::default(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            respect_turn_state: true,
            user_starts_with_turn: false,
            voice_mode: VoiceMode::Normal,
            volume: 1.0,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("session_id", &self.session_id)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("reconnection", &self.reconnection)
            .field("input_sample_rate", &self.input_sample_rate)
            .field("output_sample_rate", &self.output_sample_rate)
            .field("respect_turn_state", &self.respect_turn_state)
            .field("user_starts_with_turn", &self.user_starts_with_turn)
            .field("voice_mode", &self.voice_mode)
            .field("volume", &self.volume)
            .finish()
    }
}

/// Implement Drop to zeroize the auth token when ClientConfig is dropped.
impl Drop for ClientConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut token) = self.auth_token {
            token.zeroize();
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// Reads the `VOICE_*` variables over defaults and validates the result.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = env::load_from_env()?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded in main.rs at startup, so it already shows up as ENV here
        let yaml_config = yaml::YamlConfig::from_file(path)?;

        let mut config = env::load_from_env()?;
        merge::apply_yaml(&mut config, yaml_config)?;

        validation::validate_config(&config)?;

        Ok(config)
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Engine-level configuration for [`crate::core::realtime::RealtimeClient`].
    pub fn to_client_config(&self) -> RealtimeClientConfig {
        RealtimeClientConfig {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
            session_id: self.session_id.clone(),
            connect_timeout: self.connect_timeout(),
            heartbeat_interval: self.heartbeat_interval(),
            reconnection: self.reconnection.clone(),
            user_starts_with_turn: self.user_starts_with_turn,
        }
    }

    /// Playback scheduler configuration.
    pub fn egress_config(&self) -> EgressConfig {
        EgressConfig {
            sample_rate: self.output_sample_rate,
            overlap_seconds: PLAYBACK_OVERLAP_SECONDS,
            schedule_ahead_seconds: Some(DEFAULT_SCHEDULE_AHEAD_SECONDS),
            voice_mode: self.voice_mode,
            volume: self.volume,
            enabled: true,
        }
    }
}
