use thiserror::Error;

/// Common error type for the AquaLogic bridge components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid topic: {0}")]
    Topic(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
