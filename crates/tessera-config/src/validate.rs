//! Configuration validation rules.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

/// Reject values the host cannot run with.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] naming the first offending
/// field.
pub fn validate(config: &Config) -> ConfigResult<()> {
    let plugins = &config.plugins;
    non_zero("plugins.handshake_timeout_secs", plugins.handshake_timeout_secs)?;
    non_zero("plugins.max_archive_bytes", plugins.max_archive_bytes)?;
    non_zero(
        "plugins.default_protocol_version",
        u64::from(plugins.default_protocol_version),
    )?;
    non_zero("heartbeat.timeout_secs", config.heartbeat.timeout_secs)?;
    non_zero(
        "heartbeat.sweep_interval_secs",
        config.heartbeat.sweep_interval_secs,
    )?;

    non_empty("plugins.root_dir", &plugins.root_dir)?;
    non_empty("plugins.registry_file", &plugins.registry_file)?;
    non_empty("plugins.default_cookie_key", &plugins.default_cookie_key)?;
    if plugins.default_cookie_key.contains('=') {
        return Err(invalid(
            "plugins.default_cookie_key",
            "must be a valid environment variable name",
        ));
    }

    if !LOG_FORMATS.contains(&config.logging.format.to_ascii_lowercase().as_str()) {
        return Err(invalid(
            "logging.format",
            &format!("must be one of {}", LOG_FORMATS.join(", ")),
        ));
    }
    Ok(())
}

fn non_zero(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(result: ConfigResult<()>) -> String {
        match result {
            Err(ConfigError::ValidationError { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = Config::default();
        config.plugins.handshake_timeout_secs = 0;
        assert_eq!(field_of(validate(&config)), "plugins.handshake_timeout_secs");

        let mut config = Config::default();
        config.heartbeat.sweep_interval_secs = 0;
        assert_eq!(field_of(validate(&config)), "heartbeat.sweep_interval_secs");
    }

    #[test]
    fn test_cookie_key() {
        let mut config = Config::default();
        config.plugins.default_cookie_key = " ".to_string();
        assert_eq!(field_of(validate(&config)), "plugins.default_cookie_key");

        config.plugins.default_cookie_key = "A=B".to_string();
        assert_eq!(field_of(validate(&config)), "plugins.default_cookie_key");
    }

    #[test]
    fn test_log_format() {
        let mut config = Config::default();
        config.logging.format = "JSON".to_string();
        assert!(validate(&config).is_ok());
        config.logging.format = "xml".to_string();
        assert_eq!(field_of(validate(&config)), "logging.format");
    }
}
