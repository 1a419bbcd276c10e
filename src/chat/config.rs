//! Configuration for the chat client.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::errors::{ChatError, ChatResult};

/// Environment variable holding the Gemini API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
/// Environment variable overriding the model name.
pub const MODEL_ENV: &str = "GEMINI_CHAT_MODEL";
/// Environment variable overriding the API base URL.
pub const BASE_URL_ENV: &str = "GEMINI_CHAT_BASE_URL";
/// Environment variable overriding the storage directory.
pub const DATA_DIR_ENV: &str = "GEMINI_CHAT_DATA_DIR";
/// Environment variable overriding the per-request timeout, in seconds.
pub const TIMEOUT_ENV: &str = "GEMINI_CHAT_TIMEOUT_SECS";
/// Environment variable overriding the sampling temperature.
pub const TEMPERATURE_ENV: &str = "GEMINI_CHAT_TEMPERATURE";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Where conversations are persisted.
    pub storage: StorageConfig,
    /// Upstream model settings.
    pub gemini: GeminiConfig,
    /// Message exchange settings.
    pub exchange: ExchangeConfig,
}

impl ChatConfig {
    /// Defaults overlaid with the process environment.
    ///
    /// # Errors
    /// Returns an error if an environment value cannot be parsed.
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Blank values are treated as unset.
    ///
    /// # Errors
    /// Returns an error if a numeric value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(key) = get(API_KEY_ENV) {
            config.gemini.api_key = Some(key.trim().to_string());
        }
        if let Some(model) = get(MODEL_ENV) {
            config.gemini.model = model.trim().to_string();
        }
        if let Some(base_url) = get(BASE_URL_ENV) {
            config.gemini.base_url = base_url.trim().to_string();
        }
        if let Some(dir) = get(DATA_DIR_ENV) {
            config.storage.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = get(TIMEOUT_ENV) {
            let secs = raw.trim().parse::<u64>().map_err(|err| {
                ChatError::InvalidConfig(format!("{TIMEOUT_ENV} must be whole seconds: {err}"))
            })?;
            config.exchange.request_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get(TEMPERATURE_ENV) {
            config.gemini.temperature = raw.trim().parse::<f32>().map_err(|err| {
                ChatError::InvalidConfig(format!("{TEMPERATURE_ENV} must be a number: {err}"))
            })?;
        }

        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// The API key is not checked here; the Gemini client refuses to build
    /// without one.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        if self.storage.storage_key.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "storage.storage_key must not be empty".to_string(),
            ));
        }

        if self.gemini.model.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "gemini.model must not be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.gemini.temperature) {
            return Err(ChatError::InvalidConfig(format!(
                "gemini.temperature must be within 0.0..=2.0, got {}",
                self.gemini.temperature
            )));
        }

        if !(0.0..=1.0).contains(&self.gemini.top_p) {
            return Err(ChatError::InvalidConfig(format!(
                "gemini.top_p must be within 0.0..=1.0, got {}",
                self.gemini.top_p
            )));
        }

        if self.gemini.max_output_tokens == 0 {
            return Err(ChatError::InvalidConfig(
                "gemini.max_output_tokens must be > 0".to_string(),
            ));
        }

        if self.gemini.http_timeout.is_zero() {
            return Err(ChatError::InvalidConfig(
                "gemini.http_timeout must be > 0".to_string(),
            ));
        }

        if self.exchange.request_timeout.is_zero() {
            return Err(ChatError::InvalidConfig(
                "exchange.request_timeout must be > 0".to_string(),
            ));
        }

        if self.exchange.title_max_chars == 0 {
            return Err(ChatError::InvalidConfig(
                "exchange.title_max_chars must be > 0".to_string(),
            ));
        }

        Url::parse(&self.gemini.base_url)?;

        Ok(())
    }
}

/// Durable storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the conversation file.
    pub data_dir: PathBuf,
    /// Storage key; the file is `<data_dir>/<storage_key>.json`.
    pub storage_key: String,
}

impl StorageConfig {
    /// Full path of the conversation file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.json", self.storage_key))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            storage_key: "chat-conversations".to_string(),
        }
    }
}

/// Gemini `generateContent` settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API key, sent as the `key` query parameter. Never serialized.
    #[serde(skip)]
    pub api_key: Option<String>,
    /// API root, e.g. `https://generativelanguage.googleapis.com/v1beta`.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Top-k sampling width.
    pub top_k: u32,
    /// Maximum tokens generated per reply.
    pub max_output_tokens: u32,
    /// HTTP client timeout.
    #[serde(with = "duration_serde")]
    pub http_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-pro-exp-03-25".to_string(),
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 8192,
            http_timeout: Duration::from_secs(120),
        }
    }
}

/// Message exchange settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Characters kept when naming a conversation after its first message.
    pub title_max_chars: usize,
    /// Upper bound on a single model call.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            title_max_chars: 30,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Serde module for Duration serialization, as whole milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
