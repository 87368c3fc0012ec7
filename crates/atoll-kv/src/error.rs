//! Error types for the coordination store adapter.

/// Errors returned by [`KvStore`](crate::KvStore) and
/// [`Collection`](crate::Collection) operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The requested key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A key being created already exists.
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),
}

impl KvError {
    /// Whether this error is a [`KvError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound(_))
    }
}
