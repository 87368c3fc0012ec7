//! Shared types and identifiers for Atoll.
//!
//! This crate defines the core metadata records used across the Atoll
//! workspace: the content-addressed [`ObjectHash`], repository and commit
//! records ([`RepoInfo`], [`CommitInfo`], [`CommitRef`], [`BranchInfo`]),
//! file metadata ([`FileInfo`]), the scratch-space write records
//! ([`PutFileRecord`], [`PutFileRecords`]), and the authorization
//! [`Scope`] levels.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Content-addressed identifier for an object in the blob store:
    /// `blake3(object_data)`.
    ObjectHash
);

/// Length of a commit ID: a UUIDv4 rendered as hex without dashes.
pub const COMMIT_ID_LEN: usize = 32;

/// Generate a fresh commit ID: 32 lowercase hex characters, no dashes.
///
/// Because the underlying UUID is v4, the character at index 12 is always
/// `'4'`, which [`looks_like_commit_id`] uses as a cheap syntactic
/// discriminator against branch names.
pub fn new_commit_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Whether `id` is syntactically a commit ID rather than a branch name.
///
/// This checks only the fixed width and the UUIDv4 version nibble; it does
/// not prove the commit exists.
pub fn looks_like_commit_id(id: &str) -> bool {
    id.len() == COMMIT_ID_LEN && id.as_bytes()[12] == b'4'
}

/// Current wall-clock time as seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

// ---------------------------------------------------------------------------
// Authorization scope
// ---------------------------------------------------------------------------

/// Access level on a repository, ordered from weakest to strongest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Scope {
    /// No access.
    #[default]
    None,
    /// Read-only access.
    Reader,
    /// Read/write access.
    Writer,
    /// Full control, including deletion and ACL changes.
    Owner,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::None => "NONE",
            Scope::Reader => "READER",
            Scope::Writer => "WRITER",
            Scope::Owner => "OWNER",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Repository records
// ---------------------------------------------------------------------------

/// Access level attached to a repo record when authorization is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoAuthInfo {
    /// The caller's access level on the repo.
    pub access_level: Scope,
}

/// Metadata record for a repository.
///
/// `provenance` is stored as the *transitive closure* of upstream repos:
/// if this repo depends on `b` and `b` depends on `a`, both appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Repository name.
    pub repo: String,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
    /// Free-form description.
    pub description: String,
    /// Transitive closure of upstream repo names.
    pub provenance: Vec<String>,
    /// Total size of all finished commits' new data, in bytes.
    pub size_bytes: u64,
    /// Caller's access level; populated only when auth is active.
    pub auth_info: Option<RepoAuthInfo>,
}

// ---------------------------------------------------------------------------
// Commit records
// ---------------------------------------------------------------------------

/// Reference to a commit: a repo name plus a commit ID.
///
/// On inspection paths the `id` may also be a branch name, optionally
/// carrying git-style ancestry suffixes (`master^`, `master~2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    /// Name of the repo the commit lives in.
    pub repo: String,
    /// Commit ID, branch name, or ancestry expression.
    pub id: String,
}

impl CommitRef {
    /// Create a commit reference.
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.id)
    }
}

/// Metadata record for a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// The commit this record describes.
    pub commit: CommitRef,
    /// When the commit was started, seconds since the Unix epoch.
    pub started: u64,
    /// When the commit was finished; `None` while the commit is open.
    pub finished: Option<u64>,
    /// Parent commit; `None` for a root commit.
    pub parent_commit: Option<CommitRef>,
    /// Transitive closure of upstream commits, deduplicated by ID.
    pub provenance: Vec<CommitRef>,
    /// Object-store hash of the serialized snapshot tree; `None` while the
    /// commit is open or when the finished tree is empty.
    pub tree: Option<ObjectHash>,
    /// Total size of the snapshot in bytes.
    pub size_bytes: u64,
}

/// A named branch and the commit at its head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Branch name.
    pub name: String,
    /// Commit at the head of the branch.
    pub head: CommitRef,
}

// ---------------------------------------------------------------------------
// File records
// ---------------------------------------------------------------------------

/// Reference to a file within a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// The commit the file belongs to.
    pub commit: CommitRef,
    /// Path of the file within the commit.
    pub path: String,
}

impl FileRef {
    /// Create a file reference.
    pub fn new(commit: CommitRef, path: impl Into<String>) -> Self {
        Self {
            commit,
            path: path.into(),
        }
    }
}

/// Whether a tree node is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file backed by a list of objects.
    File,
    /// Directory.
    Dir,
}

/// Metadata about a file or directory in a commit's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// The file this record describes.
    pub file: FileRef,
    /// File or directory.
    pub file_type: FileType,
    /// Size of the file (or subtree) in bytes.
    pub size_bytes: u64,
    /// Content hash of the tree node.
    pub hash: Vec<u8>,
    /// For files: the ordered object list. Populated only on "full" reads.
    pub objects: Vec<ObjectHash>,
    /// For directories: child names. Populated only on "full" reads.
    pub children: Vec<String>,
}

/// How `put_file` cuts its input into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Delimiter {
    /// No record boundaries: the input is one file, split into fixed-size
    /// chunks by the object store.
    #[default]
    None,
    /// Newline-delimited records.
    Line,
    /// A stream of JSON values.
    Json,
}

/// A single staged append operation for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFileRecord {
    /// Hash of the object holding this record's bytes.
    pub object_hash: ObjectHash,
    /// Size of the record in bytes.
    pub size_bytes: u64,
    /// When set, existing objects at and beyond this index are replaced
    /// rather than appended to.
    pub overwrite_index: Option<u64>,
}

/// A batch of staged append operations, serialized as one scratch value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFileRecords {
    /// When true, each record becomes its own numbered child file under the
    /// target path instead of being appended to a single object list.
    pub split: bool,
    /// The staged records, in write order.
    pub records: Vec<PutFileRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_hash_display_is_hex() {
        let hash = ObjectHash::from_data(b"hello");
        let hex = hash.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_object_hash_deterministic() {
        assert_eq!(ObjectHash::from_data(b"x"), ObjectHash::from_data(b"x"));
        assert_ne!(ObjectHash::from_data(b"x"), ObjectHash::from_data(b"y"));
    }

    #[test]
    fn test_commit_id_shape() {
        let id = new_commit_id();
        assert_eq!(id.len(), COMMIT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.as_bytes()[12], b'4');
        assert!(looks_like_commit_id(&id));
    }

    #[test]
    fn test_branch_names_do_not_look_like_commit_ids() {
        assert!(!looks_like_commit_id("master"));
        assert!(!looks_like_commit_id(""));
        // right length, wrong version nibble
        assert!(!looks_like_commit_id("0123456789ab0def0123456789abcdef"));
    }

    #[test]
    fn test_scope_ordering() {
        assert!(Scope::None < Scope::Reader);
        assert!(Scope::Reader < Scope::Writer);
        assert!(Scope::Writer < Scope::Owner);
    }
}
