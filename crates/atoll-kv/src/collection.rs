//! Typed collections over the KV store.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{KvError, KvStore, Stm, Watch};

/// A secondary index over a collection.
///
/// `extract` maps a record to the index tokens it should be findable
/// under; a record may carry any number of tokens (e.g. one per
/// provenance entry). Tokens must not contain `/`.
pub struct Index<T> {
    /// Index name, used in the key layout.
    pub name: &'static str,
    /// Token extractor.
    pub extract: fn(&T) -> Vec<String>,
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

/// A typed collection of postcard-serialized records under a key prefix.
///
/// Cheap to clone. Index entries live under a sibling
/// `<prefix>__index__/<index>/<token>/<key>` prefix and carry the full
/// serialized record, so index watches deliver values directly; they are
/// maintained in the same transaction as the primary write.
#[derive(Clone)]
pub struct Collection<T> {
    kv: KvStore,
    prefix: String,
    indexes: Vec<Index<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    /// Create a collection rooted at `prefix`.
    pub fn new(kv: KvStore, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            indexes: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Attach a secondary index.
    pub fn with_index(mut self, index: Index<T>) -> Self {
        self.indexes.push(index);
        self
    }

    /// Full key for a record.
    pub fn path(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    fn index_prefix(&self, index: &str, token: &str) -> String {
        format!("{}__index__/{}/{}/", self.prefix, index, token)
    }

    fn index_path(&self, index: &str, token: &str, key: &str) -> String {
        format!("{}{}", self.index_prefix(index, token), key)
    }

    /// Read-only view, served directly from the store.
    pub fn read_only(&self) -> ReadOnly<'_, T> {
        ReadOnly { col: self }
    }

    /// Read-write view within a transaction.
    pub fn read_write<'a>(&'a self, stm: &'a mut Stm) -> ReadWrite<'a, T> {
        ReadWrite { col: self, stm }
    }

    /// Integer-counter view within a transaction.
    pub fn read_write_int<'a>(&'a self, stm: &'a mut Stm) -> ReadWriteInt<'a> {
        ReadWriteInt {
            prefix: self.prefix.clone(),
            stm,
        }
    }
}

/// Read-only operations on a [`Collection`].
pub struct ReadOnly<'a, T> {
    col: &'a Collection<T>,
}

impl<T: Serialize + DeserializeOwned> ReadOnly<'_, T> {
    /// Fetch one record.
    pub async fn get(&self, key: &str) -> Result<T, KvError> {
        let path = self.col.path(key);
        match self.col.kv.get(&path).await {
            Some(entry) => Ok(postcard::from_bytes(&entry.value)?),
            None => Err(KvError::NotFound(path)),
        }
    }

    /// List all records, newest first (descending create-revision).
    pub async fn list(&self) -> Result<Vec<(String, T)>, KvError> {
        let prefix = format!("{}/", self.col.prefix);
        let mut entries = self.col.kv.list_prefix(&prefix).await;
        entries.sort_by(|(_, a), (_, b)| b.create_revision.cmp(&a.create_revision));
        entries
            .into_iter()
            .map(|(key, entry)| {
                let record = postcard::from_bytes(&entry.value)?;
                Ok((key[prefix.len()..].to_string(), record))
            })
            .collect()
    }

    /// Fetch all records carrying an index token, newest first.
    pub async fn get_by_index(&self, index: &str, token: &str) -> Result<Vec<(String, T)>, KvError> {
        let prefix = self.col.index_prefix(index, token);
        let mut entries = self.col.kv.list_prefix(&prefix).await;
        entries.sort_by(|(_, a), (_, b)| b.create_revision.cmp(&a.create_revision));
        entries
            .into_iter()
            .map(|(key, entry)| {
                let record = postcard::from_bytes(&entry.value)?;
                Ok((key[prefix.len()..].to_string(), record))
            })
            .collect()
    }

    /// Watch a single record.
    pub async fn watch_one(&self, key: &str) -> Watch {
        self.col.kv.watch_key(self.col.path(key)).await
    }

    /// Watch every record carrying an index token.
    pub async fn watch_by_index(&self, index: &str, token: &str) -> Watch {
        self.col
            .kv
            .watch_prefix(self.col.index_prefix(index, token))
            .await
    }
}

/// Read-write operations on a [`Collection`] within a transaction.
pub struct ReadWrite<'a, T> {
    col: &'a Collection<T>,
    stm: &'a mut Stm,
}

impl<T: Serialize + DeserializeOwned> ReadWrite<'_, T> {
    /// Fetch one record.
    pub fn get(&mut self, key: &str) -> Result<T, KvError> {
        let path = self.col.path(key);
        match self.stm.get(&path) {
            Some(raw) => Ok(postcard::from_bytes(&raw)?),
            None => Err(KvError::NotFound(path)),
        }
    }

    /// List every record in the collection, in key order. The listed range
    /// is validated at commit time.
    pub fn list(&mut self) -> Result<Vec<(String, T)>, KvError> {
        let prefix = format!("{}/", self.col.prefix);
        self.stm
            .list_prefix(&prefix)
            .into_iter()
            .map(|(key, raw)| {
                let record = postcard::from_bytes(&raw)?;
                Ok((key[prefix.len()..].to_string(), record))
            })
            .collect()
    }

    /// Write a record, replacing any existing one and rewriting its index
    /// entries.
    pub fn put(&mut self, key: &str, value: &T) -> Result<(), KvError> {
        let raw = postcard::to_allocvec(value)?;
        if !self.col.indexes.is_empty() {
            let old_tokens = self.current_tokens(key)?;
            for (index, tokens) in self.col.indexes.iter().zip(old_tokens) {
                let new_tokens = (index.extract)(value);
                for token in tokens {
                    if !new_tokens.contains(&token) {
                        self.stm.delete(self.col.index_path(index.name, &token, key));
                    }
                }
                for token in new_tokens {
                    self.stm
                        .put(self.col.index_path(index.name, &token, key), raw.clone());
                }
            }
        }
        self.stm.put(self.col.path(key), raw);
        Ok(())
    }

    /// Write a record that must not already exist.
    pub fn create(&mut self, key: &str, value: &T) -> Result<(), KvError> {
        let path = self.col.path(key);
        if self.stm.get(&path).is_some() {
            return Err(KvError::AlreadyExists(path));
        }
        self.put(key, value)
    }

    /// Delete a record and its index entries.
    pub fn delete(&mut self, key: &str) -> Result<(), KvError> {
        let path = self.col.path(key);
        if self.stm.get(&path).is_none() {
            return Err(KvError::NotFound(path));
        }
        let old_tokens = self.current_tokens(key)?;
        for (index, tokens) in self.col.indexes.iter().zip(old_tokens) {
            for token in tokens {
                self.stm.delete(self.col.index_path(index.name, &token, key));
            }
        }
        self.stm.delete(path);
        Ok(())
    }

    /// Delete every record in the collection, index entries included.
    pub fn delete_all(&mut self) {
        self.stm.delete_prefix(&format!("{}/", self.col.prefix));
        self.stm.delete_prefix(&format!("{}__index__/", self.col.prefix));
    }

    /// Index tokens currently held by the stored record, one vec per index.
    fn current_tokens(&mut self, key: &str) -> Result<Vec<Vec<String>>, KvError> {
        let old: Option<T> = match self.stm.get(&self.col.path(key)) {
            Some(raw) => Some(postcard::from_bytes(&raw)?),
            None => None,
        };
        Ok(self
            .col
            .indexes
            .iter()
            .map(|index| old.as_ref().map_or_else(Vec::new, index.extract))
            .collect())
    }
}

/// Integer-counter operations within a transaction.
///
/// Counters are postcard-encoded `i64`s living in the same key space as
/// the collection's records.
pub struct ReadWriteInt<'a> {
    prefix: String,
    stm: &'a mut Stm,
}

impl ReadWriteInt<'_> {
    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    /// Create a counter with an initial value.
    pub fn create(&mut self, key: &str, value: i64) -> Result<(), KvError> {
        let path = self.path(key);
        if self.stm.get(&path).is_some() {
            return Err(KvError::AlreadyExists(path));
        }
        self.stm.put(path, postcard::to_allocvec(&value)?);
        Ok(())
    }

    /// Read a counter.
    pub fn get(&mut self, key: &str) -> Result<i64, KvError> {
        let path = self.path(key);
        match self.stm.get(&path) {
            Some(raw) => Ok(postcard::from_bytes(&raw)?),
            None => Err(KvError::NotFound(path)),
        }
    }

    /// Add 1 to a counter.
    pub fn increment(&mut self, key: &str) -> Result<(), KvError> {
        self.increment_by(key, 1)
    }

    /// Add `n` to a counter.
    pub fn increment_by(&mut self, key: &str, n: i64) -> Result<(), KvError> {
        let value = self.get(key)?;
        self.stm
            .put(self.path(key), postcard::to_allocvec(&(value + n))?);
        Ok(())
    }

    /// Subtract 1 from a counter.
    pub fn decrement(&mut self, key: &str) -> Result<(), KvError> {
        self.decrement_by(key, 1)
    }

    /// Subtract `n` from a counter.
    pub fn decrement_by(&mut self, key: &str, n: i64) -> Result<(), KvError> {
        self.increment_by(key, -n)
    }

    /// Delete a counter.
    pub fn delete(&mut self, key: &str) -> Result<(), KvError> {
        let path = self.path(key);
        if self.stm.get(&path).is_none() {
            return Err(KvError::NotFound(path));
        }
        self.stm.delete(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        deps: Vec<String>,
    }

    fn deps_index() -> Index<Record> {
        Index {
            name: "deps",
            extract: |r| r.deps.clone(),
        }
    }

    fn record(name: &str, deps: &[&str]) -> Record {
        Record {
            name: name.into(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let kv = KvStore::new();
        let col: Collection<Record> = Collection::new(kv.clone(), "records");
        let rec = record("a", &[]);
        kv.stm::<_, KvError, _>(|stm| col.read_write(stm).create("a", &rec))
            .await
            .unwrap();
        assert_eq!(col.read_only().get("a").await.unwrap(), rec);
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let kv = KvStore::new();
        let col: Collection<Record> = Collection::new(kv.clone(), "records");
        let rec = record("a", &[]);
        kv.stm::<_, KvError, _>(|stm| col.read_write(stm).create("a", &rec))
            .await
            .unwrap();
        let err = kv
            .stm::<_, KvError, _>(|stm| col.read_write(stm).create("a", &rec))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let kv = KvStore::new();
        let col: Collection<Record> = Collection::new(kv, "records");
        let err = col.read_only().get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let kv = KvStore::new();
        let col: Collection<Record> = Collection::new(kv.clone(), "records");
        for name in ["first", "second", "third"] {
            let rec = record(name, &[]);
            kv.stm::<_, KvError, _>(|stm| col.read_write(stm).create(name, &rec))
                .await
                .unwrap();
        }
        let listed = col.read_only().list().await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_index_lookup_and_maintenance() {
        let kv = KvStore::new();
        let col: Collection<Record> = Collection::new(kv.clone(), "records").with_index(deps_index());

        let b = record("b", &["a"]);
        kv.stm::<_, KvError, _>(|stm| col.read_write(stm).create("b", &b))
            .await
            .unwrap();
        let hits = col.read_only().get_by_index("deps", "a").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");

        // Re-pointing the record moves its index entry.
        let b2 = record("b", &["c"]);
        kv.stm::<_, KvError, _>(|stm| col.read_write(stm).put("b", &b2))
            .await
            .unwrap();
        assert!(col.read_only().get_by_index("deps", "a").await.unwrap().is_empty());
        assert_eq!(col.read_only().get_by_index("deps", "c").await.unwrap().len(), 1);

        // Deleting the record removes the index entry.
        kv.stm::<_, KvError, _>(|stm| col.read_write(stm).delete("b"))
            .await
            .unwrap();
        assert!(col.read_only().get_by_index("deps", "c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_by_index_delivers_records() {
        let kv = KvStore::new();
        let col: Collection<Record> = Collection::new(kv.clone(), "records").with_index(deps_index());

        let mut watch = col.read_only().watch_by_index("deps", "a").await;
        let b = record("b", &["a"]);
        kv.stm::<_, KvError, _>(|stm| col.read_write(stm).create("b", &b))
            .await
            .unwrap();

        match watch.next().await.unwrap() {
            crate::WatchEvent::Put { key, value, .. } => {
                assert!(key.ends_with("/b"));
                let got: Record = postcard::from_bytes(&value).unwrap();
                assert_eq!(got, b);
            }
            other => panic!("expected put, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_int_counters() {
        let kv = KvStore::new();
        let col: Collection<i64> = Collection::new(kv.clone(), "counts");
        kv.stm::<_, KvError, _>(|stm| {
            let mut ints = col.read_write_int(stm);
            ints.create("c", 0)?;
            ints.increment("c")?;
            ints.increment_by("c", 4)?;
            ints.decrement("c")?;
            Ok(())
        })
        .await
        .unwrap();
        let value = kv
            .stm::<_, KvError, _>(|stm| col.read_write_int(stm).get("c"))
            .await
            .unwrap();
        assert_eq!(value, 4);

        let err = kv
            .stm::<_, KvError, _>(|stm| col.read_write_int(stm).increment("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
