//! Tests for the engine crate.

mod repo_tests;
mod stream_tests;

use std::sync::Arc;

use atoll_auth::InactiveAuth;
use atoll_cas::MemoryObjectStore;
use atoll_kv::KvStore;
use atoll_types::{CommitRef, FileRef};
use bytes::Bytes;

use crate::{Driver, DriverConfig};

/// A fully in-memory driver with auth inactive.
pub(crate) fn test_driver() -> Driver {
    Driver::new(
        KvStore::new(),
        Arc::new(MemoryObjectStore::new()),
        Arc::new(InactiveAuth),
        DriverConfig::default(),
    )
}

/// Like [`test_driver`], with a small split-upload chunk size so the
/// chunking invariant is observable.
pub(crate) fn test_driver_with_chunk_size(chunk_size: u64) -> Driver {
    Driver::new(
        KvStore::new(),
        Arc::new(MemoryObjectStore::with_chunk_size(chunk_size)),
        Arc::new(InactiveAuth),
        DriverConfig::default(),
    )
}

pub(crate) fn commit(repo: &str, id: &str) -> CommitRef {
    CommitRef::new(repo, id)
}

pub(crate) fn file(repo: &str, id: &str, path: &str) -> FileRef {
    FileRef::new(commit(repo, id), path)
}

/// Create a repo with the given direct provenance.
pub(crate) async fn create_repo(driver: &Driver, name: &str, provenance: &[&str]) {
    let provenance: Vec<String> = provenance.iter().map(|s| s.to_string()).collect();
    driver
        .create_repo(name, &provenance, "", false)
        .await
        .unwrap();
}

/// Open a commit on `master`.
pub(crate) async fn start_master_commit(driver: &Driver, repo: &str) -> CommitRef {
    driver
        .start_commit(commit(repo, ""), "master", &[])
        .await
        .unwrap()
}

/// Stage string content onto a path, no delimiter.
pub(crate) async fn put_string(driver: &Driver, commit: &CommitRef, path: &str, content: &str) {
    driver
        .put_file(
            &FileRef::new(commit.clone(), path),
            Default::default(),
            0,
            0,
            None,
            Bytes::copy_from_slice(content.as_bytes()),
        )
        .await
        .unwrap();
}

/// Read a file back as a string.
pub(crate) async fn get_string(driver: &Driver, commit: &CommitRef, path: &str) -> String {
    let data = driver
        .get_file(&FileRef::new(commit.clone(), path), 0, 0)
        .await
        .unwrap();
    String::from_utf8(data.to_vec()).unwrap()
}

/// Current refcount of a repo.
pub(crate) async fn ref_count(driver: &Driver, repo: &str) -> i64 {
    let repo = repo.to_string();
    driver
        .kv
        .stm::<_, atoll_kv::KvError, _>(|stm| driver.repo_ref_counts.read_write_int(stm).get(&repo))
        .await
        .unwrap()
}

/// Whether any scratch keys remain for a commit.
pub(crate) async fn scratch_is_empty(driver: &Driver, commit: &CommitRef) -> bool {
    let prefix = format!(
        "{}/",
        driver.scratch_commit_prefix(&commit.repo, &commit.id)
    );
    driver.kv.list_prefix(&prefix).await.is_empty()
}
