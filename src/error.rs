//! Error types for the mention router.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Stats error: {0}")]
    Stats(#[from] StatsError),

    #[error("Feedback store error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Eval generation error: {0}")]
    Evals(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Instance '{name}' has an empty scope (no folders, chat_ids or entities)")]
    EmptyScope { name: String },

    #[error("Instance '{name}' has no trigger source (no words and no prompts)")]
    EmptyTrigger { name: String },

    #[error("Instance '{name}' has no forward target (target_chat or target_entity)")]
    NoTarget { name: String },

    #[error("Duplicate instance name: {0}")]
    DuplicateInstance(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Telegram transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to resolve {selector}: {reason}")]
    ResolveFailed { selector: String, reason: String },

    #[error("Unknown folder: {0}")]
    UnknownFolder(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors. Raised during classification and always recovered
/// locally as a suppress verdict.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification failures are LLM failures seen from the classifier.
pub type ClassificationError = LlmError;

/// Low-level file persistence errors shared by the on-disk stores.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stats store errors.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Unsupported stats schema version {found} (newest known: {supported})")]
    UnsupportedVersion { found: u64, supported: u64 },

    #[error("Stats migration from v{from} failed: {reason}")]
    Migration { from: u64, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Forward Record checkpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("Checkpoint persistence failed: {0}")]
    Checkpoint(#[from] PersistenceError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
