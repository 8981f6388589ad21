//! Configuration management for Hesperus
//!
//! This module handles loading, validation, and management of the hub
//! options from YAML files with sensible defaults for direct construction.

use crate::error::{HubError, Result};
use crate::enums::DeviceType;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_port() -> u16 {
    1883
}

/// Controls which topic-table entries are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// All writable kinds are downgraded to read-only sensors
    ReadOnly,
    /// Regular operation
    #[default]
    Full,
    /// Regular operation plus entries flagged experimental
    Experimental,
}

/// Hub construction options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubOptions {
    /// MQTT broker hostname or IP address
    pub host: String,

    /// MQTT broker port (typically 1883, or 8883 with TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for MQTT authentication, or None for anonymous access
    #[serde(default)]
    pub username: Option<String>,

    /// Password for MQTT authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Enable TLS towards the broker
    #[serde(default)]
    pub use_ssl: bool,

    /// Installation id; discovered from the broker when not supplied
    #[serde(default)]
    pub installation_id: Option<String>,

    /// Optional prefix prepended to every subscribe/publish topic and
    /// stripped from every incoming topic
    #[serde(default)]
    pub topic_prefix: Option<String>,

    /// Which topic-table entries are active
    #[serde(default)]
    pub operation_mode: OperationMode,

    /// Device types to exclude from subscriptions entirely
    #[serde(default, skip_serializing, skip_deserializing)]
    pub device_type_exclude_filter: Vec<DeviceType>,

    /// Metric update cadence:
    /// None = notify only when a value changes,
    /// Some(0) = notify on every received message,
    /// Some(n) = notify at most every n seconds, even if unchanged
    #[serde(default)]
    pub update_frequency_seconds: Option<u64>,

    /// Optional device model name, informational only
    #[serde(default)]
    pub model_name: Option<String>,

    /// Optional device serial identifier
    #[serde(default)]
    pub serial: Option<String>,

    /// Optional suffix appended to the generated MQTT client id; two hubs
    /// sharing one broker must not end up with equal client ids
    #[serde(default)]
    pub client_suffix: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional path to a log file
    pub file: Option<String>,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            host: "venus.local".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_ssl: false,
            installation_id: None,
            topic_prefix: None,
            operation_mode: OperationMode::Full,
            device_type_exclude_filter: Vec::new(),
            update_frequency_seconds: None,
            model_name: None,
            serial: None,
            client_suffix: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl HubOptions {
    /// Options for a broker at the given host with everything else default.
    pub fn for_host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    /// Load options from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let options: HubOptions = serde_yaml::from_str(&contents)?;
        Ok(options)
    }

    /// Save options to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(HubError::validation("host", "Host cannot be empty"));
        }

        if self.port == 0 {
            return Err(HubError::validation("port", "Port must be greater than 0"));
        }

        if let Some(id) = &self.installation_id
            && id.is_empty()
        {
            return Err(HubError::validation(
                "installation_id",
                "Installation id cannot be an empty string",
            ));
        }

        if let Some(prefix) = &self.topic_prefix
            && (prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/'))
        {
            return Err(HubError::validation(
                "topic_prefix",
                "Topic prefix must be non-empty without leading/trailing slashes",
            ));
        }

        Ok(())
    }
}
