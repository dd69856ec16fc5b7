//! Transport error taxonomy.

use serde::{Deserialize, Serialize};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in the client, the server, or the log store beneath them.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not initialized. Please call the \"connect\" method first.")]
    NotInitialized,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Consumer group '{group}' already exists on '{stream}'")]
    GroupAlreadyExists { stream: String, group: String },

    #[error("Failed to create consumer group '{group}' on '{stream}': {message}")]
    GroupCreation {
        stream: String,
        group: String,
        message: String,
    },

    #[error("{message}")]
    Handler { name: String, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Client closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl TransportError {
    /// Whether the error came from the store connection rather than from
    /// transport logic. Startup connects retry only these.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            TransportError::Connection(_) => true,
            #[cfg(feature = "redis")]
            TransportError::Redis(_) => true,
            _ => false,
        }
    }
}

/// Failure raised by a request or event handler.
///
/// Serialized into the `err` field of a response entry; the requester sees it
/// as [`TransportError::Handler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerError {
    pub name: String,
    pub message: String,
}

impl HandlerError {
    /// Generic handler failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
        }
    }

    /// Failure with an explicit kind name.
    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<HandlerError> for TransportError {
    fn from(err: HandlerError) -> Self {
        TransportError::Handler {
            name: err.name,
            message: err.message,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::with_name("SerializationError", err.to_string())
    }
}
