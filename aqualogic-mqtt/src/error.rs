//! Error types for the bridge.

use thiserror::Error;

use crate::panel::PanelError;
use crate::supervisor::SupervisorError;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while running the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// MQTT session could not be established or was lost for good.
    #[error("MQTT connection failed: {0}")]
    MqttConnection(#[from] SupervisorError),

    /// Panel connection or processing failed.
    #[error("panel connection failed: {0}")]
    Panel(#[from] PanelError),

    /// Publishing error.
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a worker error.
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<aqualogic_common::Error> for BridgeError {
    fn from(err: aqualogic_common::Error) -> Self {
        match err {
            aqualogic_common::Error::Io(e) => Self::Io(e),
            other => Self::Config(other.to_string()),
        }
    }
}
