//! Server configuration loading from file and environment variables.

use chorus_voice::VoiceConfig;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Audio and turn-taking settings.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Hosted speech model endpoint.
    #[serde(default)]
    pub speech_model: SpeechModelConfig,

    /// Downstream execution channel endpoints.
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "chorus_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Hosted speech model connection settings.
#[derive(Clone, Deserialize)]
pub struct SpeechModelConfig {
    /// WebSocket URL of the realtime endpoint.
    #[serde(default = "default_speech_model_url")]
    pub url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_speech_model")]
    pub model: String,

    #[serde(default = "default_speech_voice")]
    pub voice: String,

    /// Model used to transcribe user audio.
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    /// System instructions for the spoken assistant.
    #[serde(default = "default_instructions")]
    pub instructions: String,
}

/// Downstream execution channel endpoints. A missing URL leaves that
/// channel disconnected for every session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub team_url: Option<String>,

    #[serde(default)]
    pub coder_url: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "chorus.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_speech_model_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_speech_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}

fn default_speech_voice() -> String {
    "alloy".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_instructions() -> String {
    "You are the voice of a team of agents. Keep replies short and spoken. \
     Hand substantial work to the team with delegate_to_team, and coding work \
     to the coding agent with delegate_to_coder. Only call pause when the user \
     explicitly asks to stop."
        .to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SpeechModelConfig {
    fn default() -> Self {
        Self {
            url: default_speech_model_url(),
            api_key: String::new(),
            model: default_speech_model(),
            voice: default_speech_voice(),
            transcription_model: default_transcription_model(),
            instructions: default_instructions(),
        }
    }
}

impl fmt::Debug for SpeechModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechModelConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("transcription_model", &self.transcription_model)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CHORUS_HOST`, `CHORUS_PORT`
/// - `CHORUS_DB_PATH`
/// - `CHORUS_LOG_LEVEL`, `CHORUS_LOG_JSON` ("true" or "1" to enable)
/// - `CHORUS_INPUT_GAIN`, `CHORUS_DEBUG_AUDIO`
/// - `CHORUS_VAD_THRESHOLD`, `CHORUS_VAD_PREFIX_PADDING_MS`, `CHORUS_VAD_SILENCE_MS`
/// - `CHORUS_MODEL_SAMPLE_RATE`
/// - `CHORUS_SPEECH_MODEL_URL`, `CHORUS_SPEECH_MODEL_API_KEY`
/// - `CHORUS_TEAM_URL`, `CHORUS_CODER_URL`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting voice settings are out of range.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config
        .voice
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = var(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
                None
            }
        }
    }
    fn flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
        var(key).map(|v| v == "true" || v == "1")
    }

    if let Some(host) = parsed(&var, "CHORUS_HOST") {
        config.server.host = host;
    }
    if let Some(port) = parsed(&var, "CHORUS_PORT") {
        config.server.port = port;
    }
    if let Some(db_path) = var("CHORUS_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("CHORUS_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = flag(&var, "CHORUS_LOG_JSON") {
        config.logging.json = json;
    }
    if let Some(gain) = parsed(&var, "CHORUS_INPUT_GAIN") {
        config.voice.input_gain = gain;
    }
    if let Some(capture) = flag(&var, "CHORUS_DEBUG_AUDIO") {
        config.voice.debug_capture = capture;
    }
    if let Some(threshold) = parsed(&var, "CHORUS_VAD_THRESHOLD") {
        config.voice.vad_threshold = threshold;
    }
    if let Some(padding) = parsed(&var, "CHORUS_VAD_PREFIX_PADDING_MS") {
        config.voice.prefix_padding_ms = padding;
    }
    if let Some(silence) = parsed(&var, "CHORUS_VAD_SILENCE_MS") {
        config.voice.silence_duration_ms = silence;
    }
    if let Some(rate) = parsed(&var, "CHORUS_MODEL_SAMPLE_RATE") {
        config.voice.model_sample_rate = rate;
    }
    if let Some(url) = var("CHORUS_SPEECH_MODEL_URL") {
        config.speech_model.url = url;
    }
    if let Some(key) = var("CHORUS_SPEECH_MODEL_API_KEY") {
        config.speech_model.api_key = key;
    }
    if let Some(url) = var("CHORUS_TEAM_URL") {
        config.channels.team_url = Some(url).filter(|u| !u.trim().is_empty());
    }
    if let Some(url) = var("CHORUS_CODER_URL") {
        config.channels.coder_url = Some(url).filter(|u| !u.trim().is_empty());
    }
}
