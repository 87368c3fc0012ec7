//! Repository lifecycle: provenance closures, refcounts, deletion.

use std::sync::Arc;

use atoll_auth::{Acl, AuthClient, MemoryAuth};
use atoll_cas::MemoryObjectStore;
use atoll_kv::KvStore;
use atoll_types::Scope;

use crate::tests::{commit, create_repo, ref_count, start_master_commit, test_driver};
use crate::{Driver, DriverConfig, EngineError};

#[tokio::test]
async fn test_create_and_inspect_repo() {
    let driver = test_driver();
    driver
        .create_repo("data", &[], "input data", false)
        .await
        .unwrap();

    let info = driver.inspect_repo("data", false).await.unwrap();
    assert_eq!(info.repo, "data");
    assert_eq!(info.description, "input data");
    assert!(info.provenance.is_empty());
    assert_eq!(info.size_bytes, 0);
    assert!(info.created > 0);
}

#[tokio::test]
async fn test_invalid_repo_name_rejected() {
    let driver = test_driver();
    for name in ["", "has space", "slash/y", "dot.dot"] {
        let err = driver.create_repo(name, &[], "", false).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRepoName(_)), "{name}");
    }
}

#[tokio::test]
async fn test_create_existing_repo_fails() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;
    let err = driver.create_repo("r", &[], "", false).await.unwrap_err();
    assert!(matches!(err, EngineError::RepoExists(_)));
}

#[tokio::test]
async fn test_missing_provenance_repo_fails() {
    let driver = test_driver();
    let err = driver
        .create_repo("r", &["ghost".to_string()], "", false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RepoNotFound(_)));
}

// Scenario: a ← b ← c. The closure of c must contain both upstreams and
// refcounts must track membership, gating deletion.
#[tokio::test]
async fn test_provenance_closure_and_refcounts() {
    let driver = test_driver();
    create_repo(&driver, "a", &[]).await;
    create_repo(&driver, "b", &["a"]).await;
    create_repo(&driver, "c", &["b"]).await;

    let c = driver.inspect_repo("c", false).await.unwrap();
    assert_eq!(c.provenance, vec!["a".to_string(), "b".to_string()]);

    assert_eq!(ref_count(&driver, "a").await, 2);
    assert_eq!(ref_count(&driver, "b").await, 1);
    assert_eq!(ref_count(&driver, "c").await, 0);

    // "a" is upstream of b and c, so deleting it without force fails.
    let err = driver.delete_repo("a", false).await.unwrap_err();
    assert!(matches!(err, EngineError::HasDownstream(_)));

    driver.delete_repo("c", false).await.unwrap();
    assert_eq!(ref_count(&driver, "a").await, 1);
    assert_eq!(ref_count(&driver, "b").await, 0);
}

#[tokio::test]
async fn test_force_delete_cascade() {
    let driver = test_driver();
    create_repo(&driver, "a", &[]).await;
    create_repo(&driver, "b", &["a"]).await;

    // Force-delete the upstream first; deleting the downstream must then
    // tolerate the missing refcount.
    driver.delete_repo("a", true).await.unwrap();
    driver.delete_repo("b", false).await.unwrap();
    assert!(driver.list_repo(&[], false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_repo_rewrites_provenance() {
    let driver = test_driver();
    create_repo(&driver, "a", &[]).await;
    create_repo(&driver, "b", &[]).await;
    create_repo(&driver, "d", &["a"]).await;
    create_repo(&driver, "e", &["d"]).await;

    assert_eq!(ref_count(&driver, "a").await, 2); // d and e

    // Re-point d from a to b.
    driver
        .create_repo("d", &["b".to_string()], "", true)
        .await
        .unwrap();

    let d = driver.inspect_repo("d", false).await.unwrap();
    assert_eq!(d.provenance, vec!["b".to_string()]);

    // The downstream repo e is patched to match.
    let e = driver.inspect_repo("e", false).await.unwrap();
    assert_eq!(e.provenance, vec!["b".to_string(), "d".to_string()]);

    // a lost d and e; b gained both.
    assert_eq!(ref_count(&driver, "a").await, 0);
    assert_eq!(ref_count(&driver, "b").await, 2);
}

#[tokio::test]
async fn test_list_repo_filters_by_provenance() {
    let driver = test_driver();
    create_repo(&driver, "a", &[]).await;
    create_repo(&driver, "b", &["a"]).await;
    create_repo(&driver, "other", &[]).await;

    let all = driver.list_repo(&[], false).await.unwrap();
    assert_eq!(all.len(), 3);

    let downstream = driver.list_repo(&["a".to_string()], false).await.unwrap();
    let names: Vec<&str> = downstream.iter().map(|r| r.repo.as_str()).collect();
    assert_eq!(names, vec!["b"]);

    let err = driver
        .list_repo(&["ghost".to_string()], false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RepoNotFound(_)));
}

#[tokio::test]
async fn test_delete_repo_removes_commits_and_branches() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;
    let c = start_master_commit(&driver, "r").await;
    driver.finish_commit(&c).await.unwrap();

    driver.delete_repo("r", false).await.unwrap();
    assert!(matches!(
        driver.inspect_repo("r", false).await.unwrap_err(),
        EngineError::RepoNotFound(_)
    ));
    // The commit and branch collections are gone with the repo.
    create_repo(&driver, "r", &[]).await;
    assert!(driver.list_branch("r").await.unwrap().is_empty());
    assert!(driver.list_commit("r", None, None, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_all() {
    let driver = test_driver();
    create_repo(&driver, "a", &[]).await;
    create_repo(&driver, "b", &["a"]).await;
    driver.delete_all().await.unwrap();
    assert!(driver.list_repo(&[], false).await.unwrap().is_empty());
}

fn authed_driver(auth: Arc<MemoryAuth>) -> Driver {
    Driver::new(
        KvStore::new(),
        Arc::new(MemoryObjectStore::new()),
        auth,
        DriverConfig::default(),
    )
}

#[tokio::test]
async fn test_create_repo_grants_owner() {
    let auth = Arc::new(MemoryAuth::new("alice"));
    let driver = authed_driver(auth.clone());

    driver.create_repo("r", &[], "", false).await.unwrap();
    // The creator got OWNER via the ACL written at create time.
    let info = driver.inspect_repo("r", true).await.unwrap();
    assert_eq!(info.auth_info.unwrap().access_level, Scope::Owner);
}

#[tokio::test]
async fn test_unauthorized_writes_rejected() {
    let auth = Arc::new(MemoryAuth::new("owner"));
    auth.add_admin("owner");
    let driver = authed_driver(auth.clone());
    driver.create_repo("r", &[], "", false).await.unwrap();

    // A reader can inspect but not start commits.
    let mut acl = Acl::default();
    acl.entries.insert("reader".into(), Scope::Reader);
    auth.set_acl("r", Some(acl)).await.unwrap();
    auth.set_user("reader");

    let err = driver.inspect_commit(&commit("r", "master")).await.unwrap_err();
    // CommitNotFound, not NotAuthorized: the reader passed the auth check.
    assert!(matches!(err, EngineError::CommitNotFound(_)));
    let err = driver
        .start_commit(commit("r", ""), "master", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAuthorized { required: Scope::Writer, .. }));

    // And cannot delete the repo.
    let err = driver.delete_repo("r", false).await.unwrap_err();
    assert!(matches!(err, EngineError::NotAuthorized { required: Scope::Owner, .. }));
}
