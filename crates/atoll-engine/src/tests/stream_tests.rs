//! Streaming: subscribe-to-branch and flush-downstream.

use std::time::Duration;

use crate::tests::{commit, create_repo, put_string, start_master_commit, test_driver};
use crate::{CommitStream, EngineError};

/// Receive the next event, failing the test instead of hanging.
async fn next_commit(stream: &mut CommitStream) -> Option<atoll_types::CommitInfo> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream did not produce an event in time")
        .map(|event| event.expect("stream delivered an error"))
}

#[tokio::test]
async fn test_subscribe_delivers_commits_in_order() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;

    // Subscribe before the branch even exists.
    let mut stream = driver.subscribe_commit("r", "master", None).await.unwrap();

    let c1 = start_master_commit(&driver, "r").await;
    put_string(&driver, &c1, "/x", "1").await;
    driver.finish_commit(&c1).await.unwrap();
    let c2 = start_master_commit(&driver, "r").await;
    put_string(&driver, &c2, "/y", "2").await;
    driver.finish_commit(&c2).await.unwrap();

    let first = next_commit(&mut stream).await.unwrap();
    let second = next_commit(&mut stream).await.unwrap();
    assert_eq!(first.commit.id, c1.id);
    assert_eq!(second.commit.id, c2.id);
    assert!(first.finished.is_some());
    assert!(second.finished.is_some());

    stream.close();
}

#[tokio::test]
async fn test_subscribe_emits_existing_commits_first() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;
    let c1 = start_master_commit(&driver, "r").await;
    driver.finish_commit(&c1).await.unwrap();
    let c2 = start_master_commit(&driver, "r").await;
    driver.finish_commit(&c2).await.unwrap();

    // Both commits predate the subscription; they arrive oldest first.
    let mut stream = driver.subscribe_commit("r", "master", None).await.unwrap();
    assert_eq!(next_commit(&mut stream).await.unwrap().commit.id, c1.id);
    assert_eq!(next_commit(&mut stream).await.unwrap().commit.id, c2.id);
    stream.close();
}

#[tokio::test]
async fn test_subscribe_from_excludes_earlier_commits() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;
    let c1 = start_master_commit(&driver, "r").await;
    driver.finish_commit(&c1).await.unwrap();

    let mut stream = driver
        .subscribe_commit("r", "master", Some(c1.clone()))
        .await
        .unwrap();

    let c2 = start_master_commit(&driver, "r").await;
    driver.finish_commit(&c2).await.unwrap();

    // c1 is the `from` boundary and must not be delivered.
    assert_eq!(next_commit(&mut stream).await.unwrap().commit.id, c2.id);
    stream.close();
}

#[tokio::test]
async fn test_subscribe_waits_for_finish() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;

    let c1 = start_master_commit(&driver, "r").await;
    let mut stream = driver.subscribe_commit("r", "master", None).await.unwrap();

    // The open head is not delivered until it finishes.
    let pending = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    assert!(pending.is_err(), "open commit must not be delivered");

    driver.finish_commit(&c1).await.unwrap();
    assert_eq!(next_commit(&mut stream).await.unwrap().commit.id, c1.id);
    stream.close();
}

#[tokio::test]
async fn test_subscribe_from_other_repo_rejected() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;
    let err = driver
        .subscribe_commit("r", "master", Some(commit("other", "x")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_flush_matches_full_provenance() {
    let driver = test_driver();
    create_repo(&driver, "r1", &[]).await;
    create_repo(&driver, "r2", &[]).await;
    create_repo(&driver, "r3", &["r1", "r2"]).await;
    create_repo(&driver, "r4", &["r1"]).await;

    let a = start_master_commit(&driver, "r1").await;
    driver.finish_commit(&a).await.unwrap();
    let b = start_master_commit(&driver, "r2").await;
    driver.finish_commit(&b).await.unwrap();

    let mut stream = driver
        .flush_commit(&[a.clone(), b.clone()], None)
        .await
        .unwrap();

    // Two "pipelines" run: r3 consumes both inputs, r4 only one.
    let c_r3 = driver
        .start_commit(commit("r3", ""), "master", &[a.clone(), b.clone()])
        .await
        .unwrap();
    let _c_r4 = driver
        .start_commit(commit("r4", ""), "master", &[a.clone()])
        .await
        .unwrap();

    // Only r3's commit carries both inputs in its provenance; after the
    // one qualifying downstream repo is served, the stream closes.
    let flushed = next_commit(&mut stream).await.unwrap();
    assert_eq!(flushed.commit.id, c_r3.id);
    assert!(next_commit(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_flush_with_explicit_to_repos() {
    let driver = test_driver();
    create_repo(&driver, "src", &[]).await;
    create_repo(&driver, "out", &["src"]).await;

    let a = start_master_commit(&driver, "src").await;
    driver.finish_commit(&a).await.unwrap();

    let mut stream = driver
        .flush_commit(&[a.clone()], Some(&["out".to_string()]))
        .await
        .unwrap();

    let c = driver
        .start_commit(commit("out", ""), "master", &[a.clone()])
        .await
        .unwrap();
    assert_eq!(next_commit(&mut stream).await.unwrap().commit.id, c.id);
    assert!(next_commit(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_flush_sees_preexisting_commits() {
    let driver = test_driver();
    create_repo(&driver, "src", &[]).await;
    create_repo(&driver, "out", &["src"]).await;

    let a = start_master_commit(&driver, "src").await;
    driver.finish_commit(&a).await.unwrap();
    // The downstream commit exists before the flush is requested.
    let c = driver
        .start_commit(commit("out", ""), "master", &[a.clone()])
        .await
        .unwrap();

    let mut stream = driver.flush_commit(&[a.clone()], None).await.unwrap();
    assert_eq!(next_commit(&mut stream).await.unwrap().commit.id, c.id);
    assert!(next_commit(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_flush_without_downstream_closes_immediately() {
    let driver = test_driver();
    create_repo(&driver, "lonely", &[]).await;
    let a = start_master_commit(&driver, "lonely").await;
    driver.finish_commit(&a).await.unwrap();

    let mut stream = driver.flush_commit(&[a], None).await.unwrap();
    assert!(next_commit(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_flush_requires_from_commits() {
    let driver = test_driver();
    let err = driver.flush_commit(&[], None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_closed_stream_stops_producers() {
    let driver = test_driver();
    create_repo(&driver, "r", &[]).await;
    let stream = driver.subscribe_commit("r", "master", None).await.unwrap();
    stream.close();

    let mut stream = stream;
    // After close, the channel drains and ends.
    assert!(next_commit(&mut stream).await.is_none());
}
