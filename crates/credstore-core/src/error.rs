//! Error types for credstore

use thiserror::Error;

/// Result type alias using credstore's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for secret storage, encryption and wiring
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup or delete without an org id plus an id or entity uid
    #[error("unique identifier and org id are needed to be able to get or delete a secret")]
    IdentifierNotSet,

    /// No secret matched the request
    #[error("secret not found")]
    NotFound,

    /// Another secret already uses this (org_id, entity_uid)
    #[error("secret with the same entity_uid and org_id already exists")]
    EntityUidExists,

    /// Encrypting secure json data failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decrypting secure json data failed
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Database error, passed through verbatim
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration '{id}' failed: {message}")]
    Migration { id: String, message: String },

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No handler registered on the bus for a request type
    #[error("No handler registered for {message_type}")]
    HandlerNotFound { message_type: &'static str },

    /// Publishing a lifecycle event failed
    #[error("Event publish failed: {0}")]
    Publish(String),
}

impl Error {
    /// Create an encryption error
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }

    /// Create a decryption error
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption(message.into())
    }

    /// Create a migration error
    pub fn migration(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a handler not found error
    pub fn handler_not_found(message_type: &'static str) -> Self {
        Self::HandlerNotFound { message_type }
    }

    /// Whether this error is caused by the caller's request rather than
    /// by storage, encryption or wiring.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::IdentifierNotSet | Self::NotFound | Self::EntityUidExists
        )
    }
}
