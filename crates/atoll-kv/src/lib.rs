//! Transactional coordination store adapter.
//!
//! This crate provides the metadata layer the Atoll engine runs on:
//! - [`KvStore`] — an in-memory, etcd-shaped transactional KV with per-key
//!   create/mod revisions, prefix operations, and ordered [`Watch`] streams.
//! - [`Stm`] — a software-transactional closure: reads are validated at
//!   commit time and the closure is retried on conflict.
//! - [`Collection`] — typed collections over a key prefix, with
//!   read-only/read-write/integer-counter views and secondary indexes.
//!
//! All values are stored as [`bytes::Bytes`]; typed collections serialize
//! records with postcard.

mod collection;
mod error;
mod stm;
mod store;

pub use collection::{Collection, Index, ReadOnly, ReadWrite, ReadWriteInt};
pub use error::KvError;
pub use stm::Stm;
pub use store::{Entry, KvStore, Watch, WatchEvent};
