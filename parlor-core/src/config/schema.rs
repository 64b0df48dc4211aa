//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration for parlor
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chat backend connection
    #[serde(default)]
    pub backend: BackendConfig,
    /// Chat behaviour
    #[serde(default)]
    pub chat: ChatConfig,
    /// Local session storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    dirs::home_dir()
        .map(|h| h.join(".parlor").join("logs"))
        .unwrap_or_else(|| ".parlor/logs".into())
        .to_string_lossy()
        .into_owned()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Chat backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the chat backend, without a trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Timeout for non-streaming requests, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Chat behaviour settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Longest message the backend accepts, in characters
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Greeting shown above every transcript; never persisted
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_max_message_chars() -> usize {
    500
}

fn default_greeting() -> String {
    "Hi! What would you like to talk about today?".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            greeting: default_greeting(),
        }
    }
}

/// Local storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the persisted blobs
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

fn default_storage_dir() -> String {
    dirs::home_dir()
        .map(|h| h.join(".parlor").join("storage"))
        .unwrap_or_else(|| ".parlor/storage".into())
        .to_string_lossy()
        .into_owned()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}
