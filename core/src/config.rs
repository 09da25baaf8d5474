use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

fn default_process_name() -> String {
    "local".to_string()
}

fn default_mailbox_capacity() -> usize {
    crate::component::DEFAULT_MAILBOX_CAPACITY
}

fn default_remote_timeout_ms() -> u64 {
    1000
}

/// Runtime-wide settings. Everything has a default, so embedders that never
/// touch a config file can use [`RuntimeConfig::default`].
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Name this runtime registers under in a process registry.
    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Event mailbox depth for components built through
    /// [`crate::Runtime::new_component`].
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Deadline for cross-process Read/QualifiedRead calls.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            mailbox_capacity: default_mailbox_capacity(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse runtime config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.process_name, "local");
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.remote_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn fields_parse_from_toml() {
        let text = r#"
            process_name = "controller"
            mailbox_capacity = 16
            remote_timeout_ms = 250
        "#;
        let config = RuntimeConfig::from_toml_str(text).unwrap();
        assert_eq!(config.process_name, "controller");
        assert_eq!(config.mailbox_capacity, 16);
        assert_eq!(config.remote_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(RuntimeConfig::from_toml_str("process_name = [").is_err());
    }
}
