//! Content-addressed snapshot tree for finished commits.
//!
//! A [`HashTree`] is the immutable filesystem snapshot referenced by a
//! finished commit: a directory tree whose file nodes carry ordered object
//! lists and whose every node carries a BLAKE3 hash and a subtree size.
//! Mutation happens through an [`OpenHashTree`], obtained with
//! [`HashTree::open`]; calling [`OpenHashTree::finish`] recomputes sizes
//! and hashes bottom-up and seals the result.
//!
//! Trees serialize with postcard; the engine stores the serialized bytes
//! in the object store and keeps only the hash in commit metadata.

mod glob;
mod node;
mod tree;

pub use glob::glob_match;
pub use node::{clean_path, join_path, Node, NodeKind};
pub use tree::{HashTree, OpenHashTree};

/// Errors returned by tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// The path does not exist in the tree.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// The operation hit a node of the wrong type (file where a directory
    /// was needed, or the reverse).
    #[error("path conflict: {0}")]
    PathConflict(String),

    /// The glob pattern could not be parsed.
    #[error("malformed glob pattern: {0}")]
    MalformedGlob(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),
}

impl TreeError {
    /// Whether this error is a [`TreeError::PathNotFound`].
    pub fn is_path_not_found(&self) -> bool {
        matches!(self, TreeError::PathNotFound(_))
    }
}
