//! wolfstore Error Types

use thiserror::Error;

/// Result type alias for wolfstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// wolfstore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Wire errors
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Store errors
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Store already hosted on this endpoint: {0}")]
    StoreExists(String),

    #[error("Unexpected response to {request}: {reason}")]
    UnexpectedResponse { request: String, reason: String },

    #[error("Request {0} timed out")]
    Timeout(uuid::Uuid),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}
