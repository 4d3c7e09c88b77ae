//! Configuration validation utilities.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{KilnConfig, LogOutput, LoggingConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &KilnConfig) -> ConfigResult<()> {
    validate_logging(&config.logging)?;

    if config.plugin_dir.as_os_str().is_empty() {
        return Err(ConfigError::validation("plugin_dir must not be empty"));
    }

    if config.watch.enabled && config.watch.debounce_ms == 0 {
        return Err(ConfigError::validation(
            "watch.debounce_ms must be greater than 0",
        ));
    }

    let mut seen = HashSet::new();
    for name in &config.disabled_plugins {
        if name.trim().is_empty() {
            return Err(ConfigError::validation(
                "disabled_plugins contains an empty name",
            ));
        }
        if !seen.insert(name) {
            return Err(ConfigError::validation(format!(
                "plugin \"{name}\" is listed twice in disabled_plugins"
            )));
        }
    }

    if config.plugins.keys().any(|name| name.trim().is_empty()) {
        return Err(ConfigError::validation(
            "plugins contains a section with an empty name",
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.output is \"file\" but logging.file_path is not set",
        ));
    }
    if logging.filters.keys().any(|target| target.trim().is_empty()) {
        return Err(ConfigError::validation(
            "logging.filters contains an empty target",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(validate_config(&KilnConfig::default()).is_ok());
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = KilnConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));

        config.logging.file_path = Some("kiln.log".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_debounce() {
        let mut config = KilnConfig::default();
        config.watch.debounce_ms = 0;
        assert!(validate_config(&config).is_err());

        config.watch.enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_disabled_plugin() {
        let config = KilnConfig {
            disabled_plugins: vec!["a".into(), "a".into()],
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }
}
