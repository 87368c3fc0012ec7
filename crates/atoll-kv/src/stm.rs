//! Software-transactional access to the KV store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::store::KvInner;

/// A transaction handle passed to [`KvStore::stm`](crate::KvStore::stm)
/// closures.
///
/// Reads go straight to the store and record the observed mod-revision
/// (0 for an absent key); writes are buffered. At commit time every
/// recorded read is re-validated under the store lock and the buffered
/// writes are applied as one revision, or the whole closure is retried.
pub struct Stm {
    inner: Arc<Mutex<KvInner>>,
    /// key → mod-revision observed at first read (0 = absent).
    reads: HashMap<String, u64>,
    /// prefix → (key, mod-revision) set observed at first listing.
    prefix_reads: HashMap<String, Vec<(String, u64)>>,
    /// Buffered writes; `None` marks a delete.
    writes: BTreeMap<String, Option<Bytes>>,
}

impl Stm {
    pub(crate) fn new(inner: Arc<Mutex<KvInner>>) -> Self {
        Self {
            inner,
            reads: HashMap::new(),
            prefix_reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Read a key, observing this transaction's own pending writes.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        if let Some(write) = self.writes.get(key) {
            return write.clone();
        }
        let inner = self.inner.lock().expect("kv lock poisoned");
        let entry = inner.get(key);
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| entry.map_or(0, |e| e.mod_revision));
        entry.map(|e| e.value.clone())
    }

    /// Buffer a write.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.writes.insert(key.into(), Some(value.into()));
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    /// List all entries under a prefix in key order, observing pending
    /// writes. The listed range is validated at commit time, so a
    /// concurrent insert under the prefix conflicts the transaction.
    pub fn list_prefix(&mut self, prefix: &str) -> Vec<(String, Bytes)> {
        let store_entries = {
            let inner = self.inner.lock().expect("kv lock poisoned");
            inner.list_prefix(prefix)
        };
        self.prefix_reads
            .entry(prefix.to_string())
            .or_insert_with(|| {
                store_entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.mod_revision))
                    .collect()
            });

        // Overlay pending writes.
        let mut merged: BTreeMap<String, Bytes> = store_entries
            .into_iter()
            .map(|(k, e)| (k, e.value))
            .collect();
        for (key, write) in self.writes.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match write {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Buffer deletes for every key under a prefix.
    pub fn delete_prefix(&mut self, prefix: &str) {
        for (key, _) in self.list_prefix(prefix) {
            self.writes.insert(key, None);
        }
    }

    /// Validate reads and apply writes. Returns false on conflict.
    pub(crate) fn commit(self) -> bool {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        for (key, observed) in &self.reads {
            let current = inner.get(key).map_or(0, |e| e.mod_revision);
            if current != *observed {
                return false;
            }
        }
        for (prefix, observed) in &self.prefix_reads {
            let current: Vec<(String, u64)> = inner
                .list_prefix(prefix)
                .into_iter()
                .map(|(k, e)| (k, e.mod_revision))
                .collect();
            if current != *observed {
                return false;
            }
        }
        inner.apply(&self.writes);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::{KvError, KvStore};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pending_writes_visible_within_transaction() {
        let kv = KvStore::new();
        kv.stm::<_, KvError, _>(|stm| {
            stm.put("a", Bytes::from_static(b"1"));
            assert_eq!(stm.get("a"), Some(Bytes::from_static(b"1")));
            stm.delete("a");
            assert_eq!(stm.get("a"), None);
            Ok(())
        })
        .await
        .unwrap();
        assert!(kv.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_overlays_writes() {
        let kv = KvStore::new();
        kv.put("p/a", Bytes::from_static(b"old")).await;
        kv.put("p/b", Bytes::from_static(b"keep")).await;
        kv.stm::<_, KvError, _>(|stm| {
            stm.put("p/c", Bytes::from_static(b"new"));
            stm.delete("p/a");
            let listed = stm.list_prefix("p/");
            let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, vec!["p/b", "p/c"]);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delete_prefix_in_transaction() {
        let kv = KvStore::new();
        kv.put("p/a", Bytes::from_static(b"1")).await;
        kv.put("p/b", Bytes::from_static(b"2")).await;
        kv.put("q/c", Bytes::from_static(b"3")).await;
        kv.stm::<_, KvError, _>(|stm| {
            stm.delete_prefix("p/");
            Ok(())
        })
        .await
        .unwrap();
        assert!(kv.list_prefix("p/").await.is_empty());
        assert!(kv.get("q/c").await.is_some());
    }
}
