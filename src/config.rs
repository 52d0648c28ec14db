//! App settings, kept in the `settings` table of the store.

use crate::db::{SqliteStore, StoreError};
use crate::llm::claude::ClaudeConfig;
use crate::llm::gemini::GeminiConfig;
use crate::llm::openai::OpenAiConfig;
use crate::llm::{ModelInfo, Provider};
use std::collections::HashMap;
use std::time::Duration;

pub const SETTING_KEYS: &[&str] = &[
    "openai_api_key",
    "openai_base_url",
    "claude_api_key",
    "claude_base_url",
    "gemini_api_key",
    "gemini_base_url",
    "ollama_host",
    "default_model",
    "system_prompt",
    "message_window",
    "error_dismiss_secs",
    "stream_replies",
    "user_id",
];

pub const DEFAULT_MODEL: &str = "gemini/gemini-2.5-flash";
pub const DEFAULT_MESSAGE_WINDOW: usize = 200;
pub const DEFAULT_ERROR_DISMISS: Duration = Duration::from_secs(3);

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("{0} API key not configured")]
    MissingApiKey(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub claude_api_key: Option<String>,
    pub claude_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub ollama_host: String,
    pub default_model: String,
    pub system_prompt: Option<String>,
    pub message_window: usize,
    pub error_dismiss: Duration,
    pub stream_replies: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            claude_api_key: None,
            claude_base_url: DEFAULT_CLAUDE_BASE_URL.to_string(),
            gemini_api_key: None,
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            message_window: DEFAULT_MESSAGE_WINDOW,
            error_dismiss: DEFAULT_ERROR_DISMISS,
            stream_replies: true,
        }
    }
}

impl AppSettings {
    pub fn load(store: &SqliteStore) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| -> Result<Option<String>, ConfigError> {
            Ok(store
                .get_setting(key)?
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()))
        };

        Ok(Self {
            openai_api_key: get("openai_api_key")?,
            openai_base_url: get("openai_base_url")?.unwrap_or(defaults.openai_base_url),
            claude_api_key: get("claude_api_key")?,
            claude_base_url: get("claude_base_url")?.unwrap_or(defaults.claude_base_url),
            gemini_api_key: get("gemini_api_key")?,
            gemini_base_url: get("gemini_base_url")?.unwrap_or(defaults.gemini_base_url),
            ollama_host: get("ollama_host")?.unwrap_or(defaults.ollama_host),
            default_model: get("default_model")?.unwrap_or(defaults.default_model),
            system_prompt: get("system_prompt")?,
            message_window: match get("message_window")? {
                Some(v) => parse_value("message_window", &v)?,
                None => defaults.message_window,
            },
            error_dismiss: match get("error_dismiss_secs")? {
                Some(v) => Duration::from_secs(parse_value("error_dismiss_secs", &v)?),
                None => defaults.error_dismiss,
            },
            stream_replies: match get("stream_replies")? {
                Some(v) => parse_value("stream_replies", &v)?,
                None => defaults.stream_replies,
            },
        })
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

pub fn validate_key(key: &str) -> Result<(), ConfigError> {
    if SETTING_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(ConfigError::UnknownKey(key.to_string()))
    }
}

/// Validates and stores one setting.
pub fn update_setting(store: &SqliteStore, key: &str, value: &str) -> Result<(), ConfigError> {
    validate_key(key)?;
    match key {
        "message_window" => {
            let window: usize = parse_value(key, value.trim())?;
            if window == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        "error_dismiss_secs" => {
            parse_value::<u64>(key, value.trim())?;
        }
        "stream_replies" => {
            parse_value::<bool>(key, value.trim())?;
        }
        _ => {}
    }
    store.set_setting(key, value)?;
    Ok(())
}

pub fn remove_setting(store: &SqliteStore, key: &str) -> Result<(), ConfigError> {
    validate_key(key)?;
    store.delete_setting(key)?;
    Ok(())
}

/// All stored settings, with API keys masked for display.
pub fn masked_settings(store: &SqliteStore) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = store.get_setting(key)? {
            if key.ends_with("_api_key") {
                map.insert(key.to_string(), mask_secret(&value));
            } else {
                map.insert(key.to_string(), value);
            }
        }
    }
    Ok(map)
}

fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Resolve an LLM provider from a model string like "openai/gpt-4o", "claude/...",
/// "gemini/..." or "ollama/...". A bare model name is treated as OpenAI.
pub fn resolve_provider(model: &str, settings: &AppSettings) -> Result<(Provider, String), ConfigError> {
    if let Some(model_id) = model.strip_prefix("ollama/") {
        Ok((Provider::ollama(&settings.ollama_host), model_id.to_string()))
    } else if let Some(model_id) = model.strip_prefix("claude/") {
        let api_key = settings
            .claude_api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey("Claude"))?;
        Ok((
            Provider::Claude(ClaudeConfig {
                api_key,
                base_url: settings.claude_base_url.clone(),
            }),
            model_id.to_string(),
        ))
    } else if let Some(model_id) = model.strip_prefix("gemini/") {
        let api_key = settings
            .gemini_api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey("Gemini"))?;
        Ok((
            Provider::Gemini(GeminiConfig {
                api_key,
                base_url: settings.gemini_base_url.clone(),
            }),
            model_id.to_string(),
        ))
    } else {
        let model_id = model.strip_prefix("openai/").unwrap_or(model);
        let api_key = settings
            .openai_api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey("OpenAI"))?;
        Ok((
            Provider::OpenAi(OpenAiConfig {
                api_key,
                base_url: settings.openai_base_url.clone(),
            }),
            model_id.to_string(),
        ))
    }
}

fn model(id: &str, name: &str, provider: &str) -> ModelInfo {
    ModelInfo {
        id: id.into(),
        name: name.into(),
        provider: provider.into(),
    }
}

/// Models selectable with the keys currently configured. Ollama is local and always listed.
pub fn available_models(settings: &AppSettings) -> Vec<ModelInfo> {
    let mut models = Vec::new();

    if settings.gemini_api_key.is_some() {
        models.extend([
            model("gemini/gemini-2.5-flash", "Gemini 2.5 Flash", "Google"),
            model("gemini/gemini-2.5-pro", "Gemini 2.5 Pro", "Google"),
        ]);
    }

    if settings.openai_api_key.is_some() {
        models.extend([
            model("openai/gpt-4o", "GPT-4o", "OpenAI"),
            model("openai/gpt-4o-mini", "GPT-4o Mini", "OpenAI"),
            model("openai/gpt-4.1", "GPT-4.1", "OpenAI"),
        ]);
    }

    if settings.claude_api_key.is_some() {
        models.extend([
            model("claude/claude-sonnet-4-20250514", "Claude Sonnet 4", "Anthropic"),
            model("claude/claude-3-5-haiku-20241022", "Claude Haiku 3.5", "Anthropic"),
        ]);
    }

    models.extend([
        model("ollama/llama3", "Llama 3", "Ollama"),
        model("ollama/qwen2.5", "Qwen 2.5", "Ollama"),
    ]);

    models
}
