use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    /// Realtime model identifier appended to the backend WebSocket URL.
    pub realtime_model: String,
    pub voice: String,
    pub temperature: f64,
    /// Server-VAD activation threshold, in [0.0, 1.0].
    pub vad_threshold: f64,
    /// Audio included before detected speech, in milliseconds.
    pub vad_prefix_padding_ms: u32,
    /// Trailing silence that ends a turn, in milliseconds.
    pub vad_silence_duration_ms: u32,
    pub instructions_path: PathBuf,
    /// Spoken to the caller before the media stream is connected.
    pub welcome_message: String,
    pub log_level: Level,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-realtime-preview-2024-10-01".to_string());

        let voice = std::env::var("VOICE").unwrap_or_else(|_| "alloy".to_string());

        let temperature = parse_var("TEMPERATURE", 0.6)?;

        let vad_threshold: f64 = parse_var("VAD_THRESHOLD", 0.5)?;
        if !(0.0..=1.0).contains(&vad_threshold) {
            return Err(ConfigError::InvalidValue(
                "VAD_THRESHOLD".to_string(),
                format!("{vad_threshold} is outside [0.0, 1.0]"),
            ));
        }
        let vad_prefix_padding_ms = parse_var("VAD_PREFIX_PADDING_MS", 300)?;
        let vad_silence_duration_ms = parse_var("VAD_SILENCE_DURATION_MS", 600)?;

        let instructions_path = std::env::var("INSTRUCTIONS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts/instructions.md"));

        let welcome_message = std::env::var("WELCOME_MESSAGE").unwrap_or_else(|_| {
            "Thank you for calling. You are being connected to our virtual assistant.".to_string()
        });

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_model,
            voice,
            temperature,
            vad_threshold,
            vad_prefix_padding_ms,
            vad_silence_duration_ms,
            instructions_path,
            welcome_message,
            log_level,
        })
    }
}
