//! Configuration validation rules.

use super::schema::Config;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    let base_url = config.backend.base_url.trim();
    if base_url.is_empty() {
        errors.push("backend.base_url must not be empty".to_string());
    } else if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        errors.push("backend.base_url must start with http:// or https://".to_string());
    }
    if config.backend.timeout_secs == 0 {
        errors.push("backend.timeout_secs must be > 0".to_string());
    }

    if config.chat.max_message_chars == 0 {
        errors.push("chat.max_message_chars must be > 0".to_string());
    }

    if config.storage.dir.trim().is_empty() {
        errors.push("storage.dir must not be empty".to_string());
    }

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        errors.push(format!(
            "logging.level must be one of {}",
            LOG_LEVELS.join(", ")
        ));
    }
    if !LOG_FORMATS.contains(&config.logging.format.to_ascii_lowercase().as_str()) {
        errors.push(format!(
            "logging.format must be one of {}",
            LOG_FORMATS.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Config(errors.join("; ")))
    }
}
