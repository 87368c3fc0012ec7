//! In-memory object store backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use atoll_types::ObjectHash;
use bytes::Bytes;
use tracing::debug;

use crate::{CasError, ObjectStore, CHUNK_SIZE};

/// In-memory object store backed by a `RwLock<HashMap>`.
///
/// Content addressing makes puts idempotent: storing the same bytes twice
/// keeps a single copy.
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectHash, Bytes>>,
    chunk_size: u64,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    /// Create a store with the default [`CHUNK_SIZE`].
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    /// Create a store with a custom split-upload chunk size.
    ///
    /// Mostly useful in tests, where a small chunk size makes the split
    /// invariant observable without megabytes of input.
    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of distinct objects stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    fn insert(&self, data: Bytes) -> (ObjectHash, u64) {
        let hash = ObjectHash::from_data(&data);
        let size = data.len() as u64;
        let mut objects = self.objects.write().expect("lock poisoned");
        if objects.insert(hash, data).is_none() {
            debug!(%hash, size, "stored object");
        }
        (hash, size)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    async fn put_object(&self, data: Bytes) -> Result<(ObjectHash, u64), CasError> {
        Ok(self.insert(data))
    }

    async fn put_object_split(&self, data: Bytes) -> Result<(Vec<ObjectHash>, u64), CasError> {
        let total = data.len() as u64;
        if data.is_empty() {
            let (hash, _) = self.insert(data);
            return Ok((vec![hash], 0));
        }
        let chunk_size = self.chunk_size as usize;
        let mut hashes = Vec::with_capacity(data.len().div_ceil(chunk_size));
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            let (hash, _) = self.insert(data.slice(offset..end));
            hashes.push(hash);
            offset = end;
        }
        Ok((hashes, total))
    }

    async fn get_object(
        &self,
        hash: &ObjectHash,
        offset: u64,
        size: u64,
    ) -> Result<Bytes, CasError> {
        let objects = self.objects.read().expect("lock poisoned");
        let data = objects.get(hash).ok_or(CasError::NotFound(*hash))?;
        let start = (offset as usize).min(data.len());
        let end = if size == 0 {
            data.len()
        } else {
            (start + size as usize).min(data.len())
        };
        Ok(data.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryObjectStore::new();
        let (hash, size) = store.put_object(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(size, 5);
        let got = store.get_object(&hash, 0, 0).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_put_deduplicates() {
        let store = MemoryObjectStore::new();
        let (h1, _) = store.put_object(Bytes::from_static(b"same")).await.unwrap();
        let (h2, _) = store.put_object(Bytes::from_static(b"same")).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let store = MemoryObjectStore::new();
        let err = store
            .get_object(&ObjectHash::from_data(b"nope"), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_range() {
        let store = MemoryObjectStore::new();
        let (hash, _) = store
            .put_object(Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(
            store.get_object(&hash, 2, 3).await.unwrap(),
            Bytes::from_static(b"234")
        );
        // reads past the end are truncated
        assert_eq!(
            store.get_object(&hash, 8, 100).await.unwrap(),
            Bytes::from_static(b"89")
        );
        assert_eq!(store.get_object(&hash, 20, 0).await.unwrap(), Bytes::new());
    }

    #[tokio::test]
    async fn test_split_chunk_size_invariant() {
        let store = MemoryObjectStore::with_chunk_size(4);
        let (hashes, total) = store
            .put_object_split(Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(total, 10);
        assert_eq!(hashes.len(), 3);
        // every chunk but the last has exactly chunk_size bytes
        for hash in &hashes[..hashes.len() - 1] {
            assert_eq!(store.get_object(hash, 0, 0).await.unwrap().len(), 4);
        }
        assert_eq!(
            store.get_object(&hashes[2], 0, 0).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn test_split_exact_multiple() {
        let store = MemoryObjectStore::with_chunk_size(5);
        let (hashes, total) = store
            .put_object_split(Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(total, 10);
        assert_eq!(hashes.len(), 2);
    }

    #[tokio::test]
    async fn test_split_empty_input_yields_one_object() {
        let store = MemoryObjectStore::new();
        let (hashes, total) = store.put_object_split(Bytes::new()).await.unwrap();
        assert_eq!(total, 0);
        assert_eq!(hashes.len(), 1);
        assert!(store.get_object(&hashes[0], 0, 0).await.unwrap().is_empty());
    }
}
