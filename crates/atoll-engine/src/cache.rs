//! LRU cache of finished-commit snapshot trees.
//!
//! Only finished commits are cached: their trees are immutable, so a
//! cached [`HashTree`] never goes stale. Trees for open commits are
//! rebuilt from scratch records on every read and must never land here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use atoll_hashtree::HashTree;
use tracing::debug;

/// Thread-safe LRU cache keyed by commit ID.
///
/// All operations acquire a single lock; the critical section is pure
/// in-memory work.
pub struct TreeCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    /// Access order: front = oldest (eviction candidate), back = newest.
    order: VecDeque<String>,
    /// Cached trees.
    trees: HashMap<String, Arc<HashTree>>,
}

impl TreeCache {
    /// Create a cache holding at most `capacity` trees.
    ///
    /// A capacity of 0 disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                trees: HashMap::new(),
            }),
        }
    }

    /// Insert a tree, evicting the least recently used entry if full.
    pub fn put(&self, commit_id: &str, tree: Arc<HashTree>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.trees.remove(commit_id).is_some() {
            inner.order.retain(|id| id != commit_id);
        }
        while inner.trees.len() >= self.capacity {
            let Some(evicted) = inner.order.pop_front() else {
                break;
            };
            inner.trees.remove(&evicted);
            debug!(commit = %evicted, "evicted cached tree");
        }
        inner.trees.insert(commit_id.to_string(), tree);
        inner.order.push_back(commit_id.to_string());
    }

    /// Look up a cached tree and promote it to most-recently-used.
    pub fn get(&self, commit_id: &str) -> Option<Arc<HashTree>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let tree = inner.trees.get(commit_id)?.clone();
        inner.order.retain(|id| id != commit_id);
        inner.order.push_back(commit_id.to_string());
        Some(tree)
    }

    /// Current number of cached trees.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").trees.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
