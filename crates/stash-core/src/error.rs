use thiserror::Error;

use stash_encoding::EncodingError;

/// Errors returned by stores, connections and buckets.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No value is stored under the key.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// A key or value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A set option the backend does not implement. Logged, then ignored.
    #[error("option {option} is not supported by the {backend} backend")]
    UnsupportedOption {
        option: &'static str,
        backend: &'static str,
    },

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Invalid store or coder configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A transaction body panicked. The prefix lock was released.
    #[error("transaction on prefix {prefix:?} panicked")]
    TransactionPanicked { prefix: String },

    /// The connection was closed.
    #[error("store is closed")]
    Closed,

    /// I/O error from the underlying filesystem or process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend payload or persisted file could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` when stored bytes failed to decode.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Encoding(e) if e.is_decode())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
