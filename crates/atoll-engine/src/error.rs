//! Error types for the engine.

use atoll_auth::AuthError;
use atoll_cas::CasError;
use atoll_hashtree::TreeError;
use atoll_kv::KvError;
use atoll_types::{CommitRef, Scope};

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by [`Driver`](crate::Driver) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Repo name contains characters outside `[a-zA-Z0-9_-]`.
    #[error("repo name ({0}) invalid: only alphanumeric characters, underscores, and dashes are allowed")]
    InvalidRepoName(String),

    /// File path contains a NUL byte.
    #[error("file path cannot contain a null byte: {0}")]
    InvalidPath(String),

    /// The repo does not exist.
    #[error("repo {0} not found")]
    RepoNotFound(String),

    /// A repo being created already exists.
    #[error("cannot create repo {0} as it already exists")]
    RepoExists(String),

    /// The repo is listed in other repos' provenance and `force` was not
    /// given.
    #[error("cannot delete repo {0}: it is the provenance of other repos")]
    HasDownstream(String),

    /// The commit (or branch, or ancestor) does not exist.
    #[error("commit {0} not found")]
    CommitNotFound(CommitRef),

    /// The branch does not exist.
    #[error("branch {name} not found in repo {repo}")]
    BranchNotFound {
        /// Repo the branch was looked up in.
        repo: String,
        /// Branch name.
        name: String,
    },

    /// The file does not exist in the commit's snapshot.
    #[error("file {0} not found")]
    FileNotFound(String),

    /// A new commit's parent is still open.
    #[error("parent commit {0} has not been finished")]
    ParentNotFinished(CommitRef),

    /// The commit has already been finished.
    #[error("commit {0} has already been finished")]
    CommitFinished(CommitRef),

    /// The commit is not open, so scratch writes are rejected.
    #[error("commit {0} is not open")]
    CommitNotOpen(CommitRef),

    /// Snapshot reads need a finished commit.
    #[error("cannot read from open commit {0}")]
    CommitOpen(CommitRef),

    /// The caller lacks the required scope and auth is active.
    #[error("not authorized to perform this operation on repo {repo}: requires {required}")]
    NotAuthorized {
        /// Repo the operation targeted.
        repo: String,
        /// Scope the operation requires.
        required: Scope,
    },

    /// Malformed request (bad ranges, bad delimiters, type conflicts, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Auth service failure other than "not activated".
    #[error("auth error: {0}")]
    Auth(AuthError),

    /// Coordination store failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Object store failure.
    #[error(transparent)]
    Cas(#[from] CasError),

    /// Snapshot tree failure.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Invariant violation; likely a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this error means "the thing does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::RepoNotFound(_)
            | EngineError::CommitNotFound(_)
            | EngineError::BranchNotFound { .. }
            | EngineError::FileNotFound(_) => true,
            EngineError::Kv(e) => e.is_not_found(),
            _ => false,
        }
    }
}
