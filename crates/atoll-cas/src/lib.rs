//! Content-addressed object store client.
//!
//! The engine stores all file payloads (and serialized snapshot trees) in an
//! external blob store, addressed by BLAKE3 hash. This crate defines that
//! contract — [`ObjectStore`] — and an in-memory implementation used in
//! tests and single-process deployments.
//!
//! The store is append-only from the engine's point of view: objects are
//! written once and never mutated, so content addressing doubles as
//! deduplication.

mod error;
mod memory;

pub use error::CasError;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use atoll_types::ObjectHash;
use bytes::Bytes;

/// Split-upload chunk size, in bytes.
///
/// `put_object_split` cuts its input into chunks of exactly this size;
/// only the last chunk may be smaller. Size accounting on the write path
/// relies on this invariant.
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Contract for the external content-addressed blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The split-upload chunk size this store was configured with.
    fn chunk_size(&self) -> u64 {
        CHUNK_SIZE
    }

    /// Store one object. Returns its content hash and size.
    async fn put_object(&self, data: Bytes) -> Result<(ObjectHash, u64), CasError>;

    /// Store data as a sequence of fixed-size objects.
    ///
    /// Every returned chunk except the last has exactly
    /// [`chunk_size`](ObjectStore::chunk_size) bytes. Empty input still
    /// produces one (empty) object, so a zero-byte file gets a record.
    async fn put_object_split(&self, data: Bytes) -> Result<(Vec<ObjectHash>, u64), CasError>;

    /// Read `size` bytes of an object starting at `offset`.
    ///
    /// A `size` of 0 means "to the end". Reads past the end of the object
    /// are truncated.
    async fn get_object(&self, hash: &ObjectHash, offset: u64, size: u64)
        -> Result<Bytes, CasError>;
}
