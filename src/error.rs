//! Error types and handling for Hesperus
//!
//! This module defines the error types used throughout the library,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Hesperus operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Main error type for Hesperus
#[derive(Debug, Error)]
pub enum HubError {
    /// Could not establish or keep a connection to the MQTT broker.
    /// Bounded waits (connect, installation id, first refresh) that expire
    /// also surface as this variant.
    #[error("Cannot connect: {message}")]
    CannotConnect { message: String },

    /// An operation requiring an active connection was attempted without one
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// Internal invariant violated; indicates a bug in the caller or library
    #[error("Programming error: {message}")]
    Programming { message: String },

    /// A write was requested for a short id absent from the active topic table
    #[error("Topic not found: {message}")]
    TopicNotFound { message: String },

    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// MQTT client errors
    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },
}

impl HubError {
    /// Create a new cannot-connect error
    pub fn cannot_connect<S: Into<String>>(message: S) -> Self {
        HubError::CannotConnect {
            message: message.into(),
        }
    }

    /// Create a new not-connected error
    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        HubError::NotConnected {
            message: message.into(),
        }
    }

    /// Create a new programming error
    pub fn programming<S: Into<String>>(message: S) -> Self {
        HubError::Programming {
            message: message.into(),
        }
    }

    /// Create a new topic-not-found error
    pub fn topic_not_found<S: Into<String>>(message: S) -> Self {
        HubError::TopicNotFound {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HubError::Config {
            message: message.into(),
        }
    }

    /// Create a new MQTT error
    pub fn mqtt<S: Into<String>>(message: S) -> Self {
        HubError::Mqtt {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HubError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        HubError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HubError {
    fn from(err: serde_yaml::Error) -> Self {
        HubError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rumqttc::ClientError> for HubError {
    fn from(err: rumqttc::ClientError) -> Self {
        HubError::mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for HubError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        HubError::cannot_connect(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for HubError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HubError::cannot_connect(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HubError::cannot_connect("broker unreachable");
        assert!(matches!(err, HubError::CannotConnect { .. }));

        let err = HubError::topic_not_found("no such short id");
        assert!(matches!(err, HubError::TopicNotFound { .. }));

        let err = HubError::validation("port", "out of range");
        assert!(matches!(err, HubError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = HubError::cannot_connect("timeout");
        assert_eq!(format!("{}", err), "Cannot connect: timeout");

        let err = HubError::validation("host", "must not be empty");
        assert_eq!(
            format!("{}", err),
            "Validation error: host - must not be empty"
        );
    }
}
