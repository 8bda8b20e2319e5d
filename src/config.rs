use secrecy::{ExposeSecret, SecretBox};
use std::env;
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

const DEFAULT_ENDPOINT: &str = "wss://api.example.dev/v1/live:stream";

/// Credentials and endpoint for the streaming inference service.
#[derive(Debug)]
pub struct ApiConfig {
    api_key: SecretBox<String>,
    pub endpoint: String,
}

impl ApiConfig {
    /// Load API configuration from environment variables. Reads a `.env`
    /// file first when present (development convenience).
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_key = Self::load_api_key("VOICE_API_KEY")?;
        let endpoint =
            env::var("VOICE_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        if !endpoint.starts_with("wss://") && !endpoint.starts_with("ws://") {
            return Err(ConfigError::InvalidValue {
                field: "VOICE_ENDPOINT".to_string(),
                reason: "endpoint must be a ws:// or wss:// URL".to_string(),
            });
        }

        Ok(Self { api_key, endpoint })
    }

    fn load_api_key(env_var: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;

        if key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: env_var.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }

        Ok(SecretBox::new(Box::new(key)))
    }

    /// Get the API key (use only when opening the transport).
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// The fixed set of selectable output voice identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum VoiceId {
    #[default]
    Aoede,
    Charon,
    Fenrir,
    Kore,
    Puck,
}

/// Per-session settings handed to the transport-open call. The guidance
/// payload is owned by the persona layer and passed through unmodified.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub voice: VoiceId,
    pub capture_transcript: bool,
    pub guidance: Option<String>,
    /// Capture rate in Hz.
    pub input_sample_rate: u32,
    /// Playback rate in Hz, independent of the input rate.
    pub output_sample_rate: u32,
    /// Samples per capture frame.
    pub frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: VoiceId::default(),
            capture_transcript: true,
            guidance: None,
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 4096,
        }
    }
}

impl SessionConfig {
    /// Duration of one capture frame at the input rate.
    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.frame_size as f64 / self.input_sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn default_rates_and_frame_size() {
        let config = SessionConfig::default();
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
        assert_eq!(config.frame_size, 4096);
        assert!(config.capture_transcript);
        assert_eq!(config.guidance, None);
    }

    #[test]
    fn frame_duration_is_256ms_at_default_settings() {
        let config = SessionConfig::default();
        assert_eq!(config.frame_duration().as_millis(), 256);
    }

    #[test]
    fn voice_ids_round_trip_through_strings() {
        assert_eq!(VoiceId::from_str("Puck").unwrap(), VoiceId::Puck);
        assert_eq!(VoiceId::Kore.to_string(), "Kore");
        assert!(VoiceId::from_str("NotAVoice").is_err());
    }
}
