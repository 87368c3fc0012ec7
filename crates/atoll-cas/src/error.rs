//! Error types for the object store client.

use atoll_types::ObjectHash;

/// Errors returned by [`ObjectStore`](crate::ObjectStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// The requested object is not in the store.
    #[error("object not found: {0}")]
    NotFound(ObjectHash),

    /// I/O error from the underlying transport or disk.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
