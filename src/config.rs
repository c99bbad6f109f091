//! Configuration types.
//!
//! Loaded from a YAML file. Secrets may come from the environment instead
//! (`TELEGRAM_BOT_TOKEN`, `OPENAI_API_KEY`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "data/config.yml";

/// Name given to the instance built from legacy top-level keys.
pub const DEFAULT_INSTANCE_NAME: &str = "default";

/// Default LLM score threshold (0-5 scale).
pub const DEFAULT_THRESHOLD: u8 = 4;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    /// Holds stats.json, forwards.json, session.json and evals/.
    pub data_dir: PathBuf,
    pub log_level: String,
    /// When set, a daily-rotated log file is written here.
    pub log_dir: Option<PathBuf>,
    pub ignore_usernames: Vec<String>,
    pub ignore_user_ids: Vec<i64>,
    /// Folder name → member chats.
    pub folder_chats: BTreeMap<String, Vec<RawSelector>>,
    pub openai: OpenAiConfig,
    pub langfuse: LangfuseConfig,
    pub stats: StatsConfig,
    pub feedback: FeedbackConfig,
    pub instances: Vec<RawInstance>,

    // Legacy flat keys.
    openai_api_key: Option<String>,
    openai_model: Option<String>,
    proxy_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_dir: None,
            ignore_usernames: Vec::new(),
            ignore_user_ids: Vec::new(),
            folder_chats: BTreeMap::new(),
            openai: OpenAiConfig::default(),
            langfuse: LangfuseConfig::default(),
            stats: StatsConfig::default(),
            feedback: FeedbackConfig::default(),
            instances: Vec::new(),
            openai_api_key: None,
            openai_model: None,
            proxy_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub bot_token: Option<SecretString>,
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub proxy_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4.1-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            proxy_url: None,
            timeout_secs: 30,
        }
    }
}

impl OpenAiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LangfuseConfig {
    pub public_key: Option<String>,
    #[serde(deserialize_with = "deserialize_secret")]
    pub secret_key: Option<SecretString>,
    pub base_url: String,
}

impl Default for LangfuseConfig {
    fn default() -> Self {
        Self {
            public_key: None,
            secret_key: None,
            base_url: "https://cloud.langfuse.com".to_string(),
        }
    }
}

impl LangfuseConfig {
    /// Tracing is enabled only when both keys are present.
    pub fn is_enabled(&self) -> bool {
        self.public_key.is_some() && self.secret_key.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// 0 saves after every event.
    pub flush_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub retention_days: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

// ── Raw instance definitions ────────────────────────────────────────

/// A chat reference as written in config: numeric ID or username/link.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawSelector {
    Id(i64),
    Name(String),
}

/// One instance as written in config. Validated by
/// [`crate::pipeline::instance::normalize`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawInstance {
    pub name: Option<String>,
    pub folders: Vec<String>,
    pub chat_ids: Vec<i64>,
    pub entities: Vec<String>,
    pub words: Vec<String>,
    pub negative_words: Vec<String>,
    pub ignore_words: Vec<String>,
    pub target_chat: Option<RawSelector>,
    pub target_entity: Option<RawSelector>,
    pub false_positive_entity: Option<RawSelector>,
    pub true_positive_entity: Option<RawSelector>,
    pub folder_mute: bool,
    pub no_forward_message: bool,
    /// Preceding chat messages sent to the LLM as context.
    pub llm_context: usize,
    pub prompts: Vec<RawPrompt>,
}

/// A prompt: either bare text or a full definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPrompt {
    Text(String),
    Full(PromptDef),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    #[serde(default)]
    pub config: Option<PromptModelConfig>,
}

/// Per-prompt model overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptModelConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_threshold() -> u8 {
    DEFAULT_THRESHOLD
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

// ── Loading ─────────────────────────────────────────────────────────

impl AppConfig {
    /// Read and parse the config file, then apply environment fallbacks.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse YAML text.
    ///
    /// Without an `instances` key, the top-level instance keys form a
    /// single instance named `default`.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let root: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let root = if root.is_null() {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        } else {
            root
        };

        let mut config: AppConfig = serde_yaml::from_value(root.clone())?;

        if root.get("instances").is_none() {
            let mut legacy: RawInstance = serde_yaml::from_value(root)?;
            legacy.name = Some(DEFAULT_INSTANCE_NAME.to_string());
            config.instances = vec![legacy];
        }

        if config.openai.api_key.is_none()
            && let Some(key) = config.openai_api_key.take().filter(|k| !k.is_empty())
        {
            config.openai.api_key = Some(SecretString::from(key));
        }
        if let Some(model) = config.openai_model.take() {
            config.openai.model = model;
        }
        if config.openai.proxy_url.is_none() {
            config.openai.proxy_url = config.proxy_url.take();
        }

        Ok(config)
    }

    /// Fill unset secrets from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.telegram.bot_token.is_none()
            && let Some(token) = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.is_empty())
        {
            self.telegram.bot_token = Some(SecretString::from(token));
        }
        if self.openai.api_key.is_none()
            && let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty())
        {
            self.openai.api_key = Some(SecretString::from(key));
        }
    }

    /// Bot token, or a `MissingRequired` error with a hint.
    pub fn require_bot_token(&self) -> Result<&SecretString, ConfigError> {
        self.telegram
            .bot_token
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "telegram.bot_token".into(),
                hint: "Set it in the config file or export TELEGRAM_BOT_TOKEN".into(),
            })
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_dir.join("stats.json")
    }

    pub fn forwards_path(&self) -> PathBuf {
        self.data_dir.join("forwards.json")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn evals_dir(&self) -> PathBuf {
        self.data_dir.join("evals")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.stats.flush_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.feedback.retention_days))
    }
}
