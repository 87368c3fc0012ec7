//! In-memory transactional KV store with revisions and watches.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::stm::Stm;
use crate::KvError;

/// A stored value with its revision stamps.
///
/// `mod_revision` is the store's global revision at the entry's last
/// mutation; it provides the total order used for scratch-write replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The stored value.
    pub value: Bytes,
    /// Revision at which the key was created.
    pub create_revision: u64,
    /// Revision of the key's most recent mutation.
    pub mod_revision: u64,
}

/// A single change event delivered to a [`Watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was written (created or updated).
    Put {
        /// Full key.
        key: String,
        /// New value.
        value: Bytes,
        /// Revision of the write.
        mod_revision: u64,
    },
    /// A key was deleted.
    Delete {
        /// Full key.
        key: String,
    },
}

enum WatchRange {
    Key(String),
    Prefix(String),
}

impl WatchRange {
    fn matches(&self, key: &str) -> bool {
        match self {
            WatchRange::Key(k) => key == k,
            WatchRange::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

struct Watcher {
    range: WatchRange,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

pub(crate) struct KvInner {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    watchers: HashMap<u64, Watcher>,
    next_watcher_id: u64,
}

impl KvInner {
    /// Apply a validated write set under the store lock, bumping the global
    /// revision once and fanning events out to matching watchers in key
    /// order.
    pub(crate) fn apply(&mut self, writes: &BTreeMap<String, Option<Bytes>>) {
        if writes.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(writes.len());
        for (key, write) in writes {
            match write {
                Some(value) => {
                    let create_revision = self
                        .entries
                        .get(key)
                        .map_or(revision, |e| e.create_revision);
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            create_revision,
                            mod_revision: revision,
                        },
                    );
                    events.push(WatchEvent::Put {
                        key: key.clone(),
                        value: value.clone(),
                        mod_revision: revision,
                    });
                }
                None => {
                    if self.entries.remove(key).is_some() {
                        events.push(WatchEvent::Delete { key: key.clone() });
                    }
                }
            }
        }
        for event in events {
            let key = match &event {
                WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key.clone(),
            };
            self.watchers
                .retain(|_, w| !w.range.matches(&key) || w.tx.send(event.clone()).is_ok());
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub(crate) fn list_prefix(&self, prefix: &str) -> Vec<(String, Entry)> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

/// An ordered stream of [`WatchEvent`]s for a key or prefix.
///
/// On registration, every existing entry in range is delivered as an
/// initial `Put` event; afterwards each committed transaction's matching
/// writes arrive in commit order. Dropping the watch deregisters it.
pub struct Watch {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    _guard: WatchGuard,
}

impl Watch {
    /// Receive the next event; `None` means the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

struct WatchGuard {
    id: u64,
    inner: Arc<Mutex<KvInner>>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.watchers.remove(&self.id);
        }
    }
}

/// In-memory transactional KV store.
///
/// Cheap to clone; all clones share the same state. The lock is held only
/// for pure in-memory work, never across an await point.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Mutex<KvInner>>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(KvInner {
                entries: BTreeMap::new(),
                revision: 0,
                watchers: HashMap::new(),
                next_watcher_id: 0,
            })),
        }
    }

    /// Read a single key.
    pub async fn get(&self, key: &str) -> Option<Entry> {
        self.inner.lock().expect("kv lock poisoned").get(key).cloned()
    }

    /// Write a single key unconditionally. Returns the write's revision.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) -> u64 {
        let mut writes = BTreeMap::new();
        writes.insert(key.into(), Some(value.into()));
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner.apply(&writes);
        inner.revision
    }

    /// Delete a single key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let existed = inner.get(key).is_some();
        let mut writes = BTreeMap::new();
        writes.insert(key.to_string(), None);
        inner.apply(&writes);
        existed
    }

    /// List all entries under a prefix, in key order.
    pub async fn list_prefix(&self, prefix: &str) -> Vec<(String, Entry)> {
        self.inner
            .lock()
            .expect("kv lock poisoned")
            .list_prefix(prefix)
    }

    /// List all entries under a prefix, ordered by ascending mod-revision.
    ///
    /// This is the total write order used when replaying scratch records.
    pub async fn list_prefix_by_mod_revision(&self, prefix: &str) -> Vec<(String, Entry)> {
        let mut entries = self.list_prefix(prefix).await;
        entries.sort_by_key(|(_, e)| e.mod_revision);
        entries
    }

    /// Delete every key under a prefix in one transaction. Returns the
    /// number of keys removed.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let writes: BTreeMap<String, Option<Bytes>> = inner
            .list_prefix(prefix)
            .into_iter()
            .map(|(k, _)| (k, None))
            .collect();
        let count = writes.len();
        inner.apply(&writes);
        count
    }

    /// Open a watch on a single key.
    pub async fn watch_key(&self, key: impl Into<String>) -> Watch {
        self.watch(WatchRange::Key(key.into()))
    }

    /// Open a watch on a key prefix.
    pub async fn watch_prefix(&self, prefix: impl Into<String>) -> Watch {
        self.watch(WatchRange::Prefix(prefix.into()))
    }

    fn watch(&self, range: WatchRange) -> Watch {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        // Deliver current state first so a watcher never misses a value
        // written just before registration.
        let initial: Vec<(String, Entry)> = match &range {
            WatchRange::Key(k) => inner.get(k).map(|e| (k.clone(), e.clone())).into_iter().collect(),
            WatchRange::Prefix(p) => inner.list_prefix(p),
        };
        for (key, entry) in initial {
            let _ = tx.send(WatchEvent::Put {
                key,
                value: entry.value,
                mod_revision: entry.mod_revision,
            });
        }
        let id = inner.next_watcher_id;
        inner.next_watcher_id += 1;
        inner.watchers.insert(id, Watcher { range, tx });
        Watch {
            rx,
            _guard: WatchGuard {
                id,
                inner: self.inner.clone(),
            },
        }
    }

    /// Run `f` as a software transaction.
    ///
    /// The closure reads through an [`Stm`] handle that records observed
    /// revisions; at commit time the reads are re-validated under the store
    /// lock and, on conflict, the closure is retried with a fresh handle.
    /// A closure error aborts the transaction without retrying. The closure
    /// must therefore be free of side effects outside the handle.
    pub async fn stm<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Stm) -> Result<T, E>,
        E: From<KvError>,
    {
        loop {
            let mut stm = Stm::new(self.inner.clone());
            let out = f(&mut stm)?;
            if stm.commit() {
                return Ok(out);
            }
            debug!("stm conflict, retrying transaction");
            tokio::task::yield_now().await;
        }
    }
}
