//! Tree nodes and path canonicalization.

use atoll_types::ObjectHash;
use serde::{Deserialize, Serialize};

/// Canonicalize a file path.
///
/// Empty components are dropped, a leading slash is added, and any
/// trailing slash is stripped. The root is the empty string.
pub fn clean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        out.push('/');
        out.push_str(component);
    }
    out
}

/// Join two canonical paths.
pub fn join_path(base: &str, rel: &str) -> String {
    clean_path(&format!("{base}/{rel}"))
}

/// Return the parent of a canonical path; `None` for the root.
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(&path[..path.rfind('/').unwrap_or(0)])
}

/// Base name of a canonical path; empty for the root.
pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// What a tree node holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Regular file: an ordered list of object references.
    File {
        /// Objects making up the file's content, in append order.
        objects: Vec<ObjectHash>,
    },
    /// Directory: sorted child names.
    Dir {
        /// Child base names, sorted.
        children: Vec<String>,
    },
}

/// One node of a snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Base name; empty for the root.
    pub name: String,
    /// BLAKE3 hash of the node's content; zeroed while the tree is open.
    pub hash: [u8; 32],
    /// Size of the file, or sum of sizes below a directory, in bytes.
    pub subtree_size: i64,
    /// File or directory payload.
    pub kind: NodeKind,
}

impl Node {
    pub(crate) fn new_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: [0; 32],
            subtree_size: 0,
            kind: NodeKind::Dir {
                children: Vec::new(),
            },
        }
    }

    pub(crate) fn new_file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: [0; 32],
            subtree_size: 0,
            kind: NodeKind::File {
                objects: Vec::new(),
            },
        }
    }

    /// Whether this node is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Whether this node is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    /// The object list of a file node; empty for directories.
    pub fn objects(&self) -> &[ObjectHash] {
        match &self.kind {
            NodeKind::File { objects } => objects,
            NodeKind::Dir { .. } => &[],
        }
    }

    /// The child names of a directory node; empty for files.
    pub fn children(&self) -> &[String] {
        match &self.kind {
            NodeKind::Dir { children } => children,
            NodeKind::File { .. } => &[],
        }
    }
}
