//! Error types for store operations.
//!
//! Read-path operations (`get_store_value`, `add_middleware`, action
//! dispatch) surface these to the caller. Write-path and persistence
//! failures are logged and absorbed instead; they only appear here so the
//! internals can use `?` before the boundary swallows them.

use thiserror::Error;

/// Errors that can occur while operating on stores.
#[derive(Debug, Error)]
pub enum PulsyError {
    /// No store is registered under this name.
    #[error("store not found: {0}")]
    NotFound(String),

    /// The store exists but holds a different value type.
    #[error("store {name} does not hold a value of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    /// Invalid store name or malformed initialization input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence envelope could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A middleware stage rejected the candidate value.
    #[error("middleware failed for store {store}: {message}")]
    Middleware { store: String, message: String },

    /// Storage backend ran out of space.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// Invalid storage key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, PulsyError>;

impl PulsyError {
    /// Create a middleware failure for the given store.
    pub fn middleware(store: impl Into<String>, message: impl Into<String>) -> Self {
        PulsyError::Middleware {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error is one a calling component must handle,
    /// as opposed to a failure the write path degrades through.
    pub fn is_read_path(&self) -> bool {
        matches!(
            self,
            PulsyError::NotFound(_)
                | PulsyError::TypeMismatch { .. }
                | PulsyError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for PulsyError {
    fn from(err: serde_json::Error) -> Self {
        PulsyError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PulsyError {
    fn from(err: toml::de::Error) -> Self {
        PulsyError::ConfigParse(err.to_string())
    }
}
