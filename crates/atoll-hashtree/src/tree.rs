//! The snapshot tree and its mutable overlay.

use std::collections::BTreeMap;

use atoll_types::ObjectHash;
use bytes::Bytes;

use crate::glob::glob_match;
use crate::node::{base_name, clean_path, parent_path, Node, NodeKind};
use crate::TreeError;

/// An immutable, fully hashed snapshot tree.
///
/// Obtained from [`OpenHashTree::finish`] or by deserializing stored
/// bytes. The root is the empty path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTree {
    nodes: BTreeMap<String, Node>,
}

impl HashTree {
    /// An empty, finished tree.
    pub fn empty() -> Self {
        OpenHashTree::new().finish()
    }

    /// Start a mutable overlay on top of this snapshot.
    pub fn open(&self) -> OpenHashTree {
        OpenHashTree {
            nodes: self.nodes.clone(),
        }
    }

    /// Fetch the node at a path.
    pub fn get(&self, path: &str) -> Result<&Node, TreeError> {
        get_node(&self.nodes, path)
    }

    /// List the children of a directory, sorted by name.
    pub fn list(&self, path: &str) -> Result<Vec<&Node>, TreeError> {
        list_children(&self.nodes, path)
    }

    /// Visit the node at `path` and every descendant, in path order.
    pub fn walk<F>(&self, path: &str, mut f: F) -> Result<(), TreeError>
    where
        F: FnMut(&str, &Node) -> Result<(), TreeError>,
    {
        let path = clean_path(path);
        let node = get_node(&self.nodes, &path)?;
        f(&path, node)?;
        let prefix = format!("{path}/");
        for (key, node) in self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            f(key, node)?;
        }
        Ok(())
    }

    /// All nodes whose path matches a glob pattern, in path order.
    pub fn glob(&self, pattern: &str) -> Result<Vec<(String, &Node)>, TreeError> {
        let pattern = clean_path(pattern);
        let mut matched = Vec::new();
        for (key, node) in &self.nodes {
            if key.is_empty() {
                continue;
            }
            if glob_match(&pattern, key)? {
                matched.push((key.clone(), node));
            }
        }
        Ok(matched)
    }

    /// Compare the subtree at `new_path` in `self` against `old_path` in
    /// `old`, invoking `f(path, node, is_new)` for every differing node.
    ///
    /// `depth` bounds recursion below the compared roots; -1 is unbounded.
    /// Paths are reported absolute within their respective trees. The
    /// compared roots themselves are reported only when they are files.
    pub fn diff<F>(
        &self,
        old: &HashTree,
        new_path: &str,
        old_path: &str,
        depth: i64,
        mut f: F,
    ) -> Result<(), TreeError>
    where
        F: FnMut(&str, &Node, bool) -> Result<(), TreeError>,
    {
        self.diff_at(
            old,
            &clean_path(new_path),
            &clean_path(old_path),
            depth,
            true,
            &mut f,
        )
    }

    fn diff_at<F>(
        &self,
        old: &HashTree,
        new_abs: &str,
        old_abs: &str,
        depth: i64,
        is_root: bool,
        f: &mut F,
    ) -> Result<(), TreeError>
    where
        F: FnMut(&str, &Node, bool) -> Result<(), TreeError>,
    {
        let new_node = self.nodes.get(new_abs);
        let old_node = old.nodes.get(old_abs);
        if let (Some(n), Some(o)) = (new_node, old_node) {
            if n.hash == o.hash && n.is_dir() == o.is_dir() {
                return Ok(());
            }
        }
        if let Some(n) = new_node {
            if !(is_root && n.is_dir()) {
                f(new_abs, n, true)?;
            }
        }
        if let Some(o) = old_node {
            if !(is_root && o.is_dir()) {
                f(old_abs, o, false)?;
            }
        }
        if depth == 0 {
            return Ok(());
        }
        let mut names: Vec<&String> = Vec::new();
        if let Some(n) = new_node {
            names.extend(n.children());
        }
        if let Some(o) = old_node {
            for name in o.children() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        let next_depth = if depth > 0 { depth - 1 } else { depth };
        for name in names {
            self.diff_at(
                old,
                &format!("{new_abs}/{name}"),
                &format!("{old_abs}/{name}"),
                next_depth,
                false,
                f,
            )?;
        }
        Ok(())
    }

    /// Total size of the snapshot in bytes.
    pub fn fs_size(&self) -> i64 {
        self.nodes.get("").map_or(0, |root| root.subtree_size)
    }

    /// Whether the tree holds nothing but the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Serialize the tree for storage.
    pub fn serialize(&self) -> Result<Bytes, TreeError> {
        Ok(Bytes::from(postcard::to_allocvec(&self.nodes)?))
    }

    /// Reconstruct a tree from stored bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, TreeError> {
        let nodes: BTreeMap<String, Node> = postcard::from_bytes(data)?;
        Ok(Self { nodes })
    }
}

/// A mutable overlay on a snapshot, used while folding staged writes.
///
/// Node hashes are stale while open; [`OpenHashTree::finish`] rebuilds
/// child lists, recomputes sizes and hashes bottom-up, and seals the tree.
#[derive(Debug, Clone)]
pub struct OpenHashTree {
    nodes: BTreeMap<String, Node>,
}

impl Default for OpenHashTree {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenHashTree {
    /// An empty open tree.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::new_dir(""));
        Self { nodes }
    }

    /// Fetch the node at a path.
    pub fn get(&self, path: &str) -> Result<&Node, TreeError> {
        get_node(&self.nodes, path)
    }

    /// List the children of a directory, sorted by name.
    pub fn list(&self, path: &str) -> Result<Vec<&Node>, TreeError> {
        list_children(&self.nodes, path)
    }

    /// Append objects to a file, creating it (and its parents) if needed.
    pub fn put_file(
        &mut self,
        path: &str,
        objects: &[ObjectHash],
        size: i64,
    ) -> Result<(), TreeError> {
        let path = clean_path(path);
        if path.is_empty() {
            return Err(TreeError::PathConflict("/".to_string()));
        }
        self.ensure_parents(&path)?;
        match self.nodes.get_mut(&path) {
            Some(node) => match &mut node.kind {
                NodeKind::File { objects: existing } => {
                    existing.extend_from_slice(objects);
                    node.subtree_size += size;
                }
                NodeKind::Dir { .. } => return Err(TreeError::PathConflict(path)),
            },
            None => {
                let mut node = Node::new_file(base_name(&path));
                node.kind = NodeKind::File {
                    objects: objects.to_vec(),
                };
                node.subtree_size = size;
                self.insert_child(&path, node);
            }
        }
        self.bump_ancestors(&path, size);
        Ok(())
    }

    /// Replace a file's objects from `overwrite_index` onward and adjust
    /// its size by `size_delta`.
    pub fn put_file_overwrite(
        &mut self,
        path: &str,
        objects: &[ObjectHash],
        overwrite_index: u64,
        size_delta: i64,
    ) -> Result<(), TreeError> {
        let path = clean_path(path);
        if path.is_empty() {
            return Err(TreeError::PathConflict("/".to_string()));
        }
        self.ensure_parents(&path)?;
        match self.nodes.get_mut(&path) {
            Some(node) => match &mut node.kind {
                NodeKind::File { objects: existing } => {
                    existing.truncate(overwrite_index as usize);
                    existing.extend_from_slice(objects);
                    node.subtree_size += size_delta;
                }
                NodeKind::Dir { .. } => return Err(TreeError::PathConflict(path)),
            },
            None => {
                let mut node = Node::new_file(base_name(&path));
                node.kind = NodeKind::File {
                    objects: objects.to_vec(),
                };
                node.subtree_size = size_delta;
                self.insert_child(&path, node);
            }
        }
        self.bump_ancestors(&path, size_delta);
        Ok(())
    }

    /// Remove the node at a path, along with any descendants.
    ///
    /// Deleting the root clears the tree.
    pub fn delete_file(&mut self, path: &str) -> Result<(), TreeError> {
        let path = clean_path(path);
        if path.is_empty() {
            self.nodes.clear();
            self.nodes.insert(String::new(), Node::new_dir(""));
            return Ok(());
        }
        let size = match self.nodes.get(&path) {
            Some(node) => node.subtree_size,
            None => return Err(TreeError::PathNotFound(path)),
        };
        let prefix = format!("{path}/");
        let descendants: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in descendants {
            self.nodes.remove(&key);
        }
        self.nodes.remove(&path);
        if let Some(parent) = parent_path(&path) {
            let name = base_name(&path).to_string();
            if let Some(Node {
                kind: NodeKind::Dir { children },
                ..
            }) = self.nodes.get_mut(parent)
            {
                children.retain(|c| *c != name);
            }
        }
        self.bump_ancestors(&path, -size);
        Ok(())
    }

    /// Seal the tree: rebuild child lists, then recompute sizes and
    /// hashes bottom-up.
    pub fn finish(mut self) -> HashTree {
        let keys: Vec<String> = self.nodes.keys().cloned().collect();

        // Child lists are rebuilt from the key set so the sealed tree
        // cannot disagree with itself.
        for key in &keys {
            if let Some(Node {
                kind: NodeKind::Dir { children },
                ..
            }) = self.nodes.get_mut(key)
            {
                children.clear();
            }
        }
        for key in &keys {
            if key.is_empty() {
                continue;
            }
            let name = base_name(key).to_string();
            let parent = parent_path(key).unwrap_or("").to_string();
            if let Some(Node {
                kind: NodeKind::Dir { children },
                ..
            }) = self.nodes.get_mut(&parent)
            {
                children.push(name);
            }
        }

        // Reverse path order visits every child before its parent.
        for key in keys.iter().rev() {
            let (hash, size) = {
                let node = &self.nodes[key];
                match &node.kind {
                    NodeKind::File { objects } => {
                        let mut hasher = blake3::Hasher::new();
                        for object in objects {
                            hasher.update(object.as_bytes());
                        }
                        (hasher.finalize().into(), node.subtree_size)
                    }
                    NodeKind::Dir { children } => {
                        let mut hasher = blake3::Hasher::new();
                        let mut size = 0i64;
                        for child in children {
                            let child_key = format!("{key}/{child}");
                            let child_node = &self.nodes[&child_key];
                            hasher.update(child.as_bytes());
                            hasher.update(&child_node.hash);
                            size += child_node.subtree_size;
                        }
                        (hasher.finalize().into(), size)
                    }
                }
            };
            let node = self.nodes.get_mut(key).expect("key came from this map");
            node.hash = hash;
            node.subtree_size = size;
        }

        HashTree { nodes: self.nodes }
    }

    /// Create any missing ancestor directories of `path`.
    fn ensure_parents(&mut self, path: &str) -> Result<(), TreeError> {
        let mut ancestors = Vec::new();
        for (i, b) in path.bytes().enumerate() {
            if b == b'/' && i > 0 {
                ancestors.push(&path[..i]);
            }
        }
        for ancestor in ancestors {
            match self.nodes.get(ancestor) {
                Some(node) if node.is_dir() => {}
                Some(_) => return Err(TreeError::PathConflict(ancestor.to_string())),
                None => {
                    let node = Node::new_dir(base_name(ancestor));
                    self.insert_child(ancestor, node);
                }
            }
        }
        Ok(())
    }

    /// Insert a node and register it with its parent's child list.
    fn insert_child(&mut self, path: &str, node: Node) {
        if let Some(parent) = parent_path(path) {
            let name = base_name(path).to_string();
            if let Some(Node {
                kind: NodeKind::Dir { children },
                ..
            }) = self.nodes.get_mut(parent)
            {
                if let Err(pos) = children.binary_search(&name) {
                    children.insert(pos, name);
                }
            }
        }
        self.nodes.insert(path.to_string(), node);
    }

    /// Add `delta` to the subtree size of every proper ancestor of `path`.
    fn bump_ancestors(&mut self, path: &str, delta: i64) {
        let mut current = parent_path(path);
        while let Some(ancestor) = current {
            if let Some(node) = self.nodes.get_mut(ancestor) {
                node.subtree_size += delta;
            }
            current = parent_path(ancestor);
        }
    }
}

fn get_node<'a>(nodes: &'a BTreeMap<String, Node>, path: &str) -> Result<&'a Node, TreeError> {
    let path = clean_path(path);
    nodes.get(&path).ok_or(TreeError::PathNotFound(path))
}

fn list_children<'a>(
    nodes: &'a BTreeMap<String, Node>,
    path: &str,
) -> Result<Vec<&'a Node>, TreeError> {
    let path = clean_path(path);
    let node = nodes.get(&path).ok_or_else(|| TreeError::PathNotFound(path.clone()))?;
    match &node.kind {
        NodeKind::Dir { children } => Ok(children
            .iter()
            .filter_map(|name| nodes.get(&format!("{path}/{name}")))
            .collect()),
        NodeKind::File { .. } => Err(TreeError::PathConflict(path)),
    }
}
