use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8787/ws";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_AUTO_SELECT_DELAY_MS: u64 = 1_500;
const DEFAULT_CALL_RETRY_DELAY_MS: u64 = 2_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a number of milliseconds, got {value:?}")]
    InvalidMillis { var: &'static str, value: String },
    #[error("{var} is not a valid url: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{var} must use ws:// or wss://, got {scheme}")]
    UnsupportedScheme { var: &'static str, scheme: String },
}

/// Participant settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub relay_url: String,
    /// Overrides the default `~/.duet` snapshot directory.
    pub data_dir: Option<PathBuf>,
    pub auto_select_delay: Duration,
    pub call_retry_delay: Duration,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    /// Base url of a chat-completions endpoint, used when no Gemini key is set.
    pub chat_url: Option<String>,
    pub chat_api_key: Option<String>,
    pub chat_model: String,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let relay_url =
            env::var("DUET_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        validate_relay_url("DUET_RELAY_URL", &relay_url)?;
        let data_dir = env::var("DUET_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let auto_select_delay =
            env_millis("DUET_AUTO_SELECT_DELAY_MS", DEFAULT_AUTO_SELECT_DELAY_MS)?;
        let call_retry_delay = env_millis("DUET_CALL_RETRY_DELAY_MS", DEFAULT_CALL_RETRY_DELAY_MS)?;
        let gemini_api_key = non_blank("DUET_GEMINI_API_KEY");
        let gemini_model =
            env::var("DUET_GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        let chat_url = non_blank("DUET_CHAT_URL");
        let chat_api_key = non_blank("DUET_CHAT_API_KEY");
        let chat_model =
            env::var("DUET_CHAT_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string());
        let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
        Ok(Self {
            relay_url,
            data_dir,
            auto_select_delay,
            call_retry_delay,
            gemini_api_key,
            gemini_model,
            chat_url,
            chat_api_key,
            chat_model,
            log_filter,
        })
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Result<Self, ConfigError> {
        let relay_url = relay_url.into();
        validate_relay_url("--relay", &relay_url)?;
        self.relay_url = relay_url;
        Ok(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            data_dir: None,
            auto_select_delay: Duration::from_millis(DEFAULT_AUTO_SELECT_DELAY_MS),
            call_retry_delay: Duration::from_millis(DEFAULT_CALL_RETRY_DELAY_MS),
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            chat_url: None,
            chat_api_key: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            log_filter: "info".into(),
        }
    }
}

fn non_blank(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidMillis { var, value }),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

fn validate_relay_url(var: &'static str, raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { var, source })?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::UnsupportedScheme {
            var,
            scheme: other.to_string(),
        }),
    }
}
