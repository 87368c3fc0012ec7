//! Streaming: subscribe-to-branch and flush-downstream.
//!
//! Both primitives return a [`CommitStream`]: a bounded channel of
//! commit events fed by background tasks. Every blocking point in the
//! producers selects on a shared done flag, so closing (or dropping) the
//! stream tears the tasks down; errors arrive as a final event, then the
//! channel closes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use atoll_kv::WatchEvent;
use atoll_types::{CommitInfo, CommitRef};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::driver::{commit_token, Driver, PROVENANCE_INDEX};
use crate::error::{EngineError, Result};

/// A stream of finished commits, delivered oldest-first.
///
/// Dropping the stream (or calling [`close`](CommitStream::close)) stops
/// the producing tasks.
#[derive(Debug)]
pub struct CommitStream {
    rx: mpsc::Receiver<Result<CommitInfo>>,
    done: watch::Sender<bool>,
}

impl CommitStream {
    /// Receive the next event. `None` means the stream has ended.
    pub async fn next(&mut self) -> Option<Result<CommitInfo>> {
        self.rx.recv().await
    }

    /// Stop the stream and its producing tasks.
    pub fn close(&self) {
        let _ = self.done.send(true);
    }
}

/// Wait until the done flag is raised; sender drop counts as done.
async fn done_wait(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|d| *d).await;
}

/// Send an event unless the stream is being torn down. Returns false
/// when the producer should stop.
async fn send_event(
    tx: &mpsc::Sender<Result<CommitInfo>>,
    done: &mut watch::Receiver<bool>,
    event: Result<CommitInfo>,
) -> bool {
    tokio::select! {
        sent = tx.send(event) => sent.is_ok(),
        _ = done_wait(done) => false,
    }
}

impl Driver {
    /// Subscribe to finished commits on a branch.
    ///
    /// Delivers every finished commit on `branch` strictly after `from`,
    /// oldest first, including commits that finish while the subscription
    /// is open. A branch that does not exist yet is treated as empty.
    pub async fn subscribe_commit(
        &self,
        repo: &str,
        branch: &str,
        from: Option<CommitRef>,
    ) -> Result<CommitStream> {
        if from.as_ref().is_some_and(|c| c.repo != repo) {
            return Err(EngineError::InvalidArgument(format!(
                "the `from` commit needs to be from repo {repo}"
            )));
        }

        // The watch opens before the listing so commits landing in
        // between are not missed.
        let mut branch_watch = self.branches(repo).read_only().watch_one(branch).await;

        let (tx, rx) = mpsc::channel(16);
        let (done_tx, mut done_rx) = watch::channel(false);

        let driver = self.clone();
        let repo = repo.to_string();
        let branch = branch.to_string();
        tokio::spawn(async move {
            let result = async {
                let mut seen: HashSet<String> = HashSet::new();

                // Emit the finished commits already on the branch,
                // oldest first.
                let to = CommitRef::new(repo.clone(), branch.clone());
                let existing = match driver.list_commit(&repo, from.as_ref(), Some(&to), 0).await {
                    Ok(commits) => commits,
                    // A branch (or repo) that does not exist yet is
                    // simply empty.
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                };
                for record in existing.into_iter().rev() {
                    if record.finished.is_some() {
                        let id = record.commit.id.clone();
                        if !send_event(&tx, &mut done_rx, Ok(record)).await {
                            return Ok(());
                        }
                        seen.insert(id);
                    }
                }

                loop {
                    // Wait for the branch head to move to an unseen
                    // commit.
                    let head = loop {
                        let event = tokio::select! {
                            ev = branch_watch.next() => ev,
                            _ = done_wait(&mut done_rx) => return Ok(()),
                        };
                        let head: CommitRef = match event {
                            Some(WatchEvent::Put { value, .. }) => {
                                postcard::from_bytes(&value).map_err(atoll_kv::KvError::from)?
                            }
                            Some(WatchEvent::Delete { .. }) => continue,
                            None => return Ok(()),
                        };
                        let skip = seen.contains(&head.id)
                            || from.as_ref().is_some_and(|f| f.id == head.id);
                        if !skip {
                            break head;
                        }
                    };

                    // Watch the commit itself until it is finished; a
                    // deletion sends us back to the branch watch.
                    let mut commit_watch = driver
                        .commits(&head.repo)
                        .read_only()
                        .watch_one(&head.id)
                        .await;
                    loop {
                        let event = tokio::select! {
                            ev = commit_watch.next() => ev,
                            _ = done_wait(&mut done_rx) => return Ok(()),
                        };
                        let record: CommitInfo = match event {
                            Some(WatchEvent::Put { value, .. }) => {
                                postcard::from_bytes(&value).map_err(atoll_kv::KvError::from)?
                            }
                            Some(WatchEvent::Delete { .. }) => break,
                            None => return Ok(()),
                        };
                        if record.finished.is_some() {
                            let id = record.commit.id.clone();
                            if !send_event(&tx, &mut done_rx, Ok(record)).await {
                                return Ok(());
                            }
                            seen.insert(id);
                            break;
                        }
                    }
                }
            }
            .await;

            if let Err(e) = result {
                warn!(error = %e, "subscribe stream terminated with error");
                let _ = send_event(&tx, &mut done_rx, Err(e)).await;
            }
        });

        Ok(CommitStream { rx, done: done_tx })
    }

    /// Wait for the downstream commits of a set of input commits.
    ///
    /// Emits exactly one commit per qualifying downstream repo: the first
    /// commit there whose provenance contains *all* of `from_commits`.
    /// With `to_repos` unset, the downstream set is every repo whose
    /// provenance closure includes every input commit's repo.
    pub async fn flush_commit(
        &self,
        from_commits: &[CommitRef],
        to_repos: Option<&[String]>,
    ) -> Result<CommitStream> {
        if from_commits.is_empty() {
            return Err(EngineError::InvalidArgument(
                "from_commits cannot be empty".to_string(),
            ));
        }
        let mut resolved = Vec::with_capacity(from_commits.len());
        for commit in from_commits {
            resolved.push(self.inspect_commit(commit).await?.commit);
        }

        let target_repos: Vec<String> = match to_repos {
            Some(repos) => repos.to_vec(),
            None => {
                // Keep only repos downstream of *every* input commit.
                let mut repo_counts: HashMap<String, usize> = HashMap::new();
                let mut downstream: Vec<String> = Vec::new();
                for commit in &resolved {
                    let hits = self
                        .repos
                        .read_only()
                        .get_by_index(PROVENANCE_INDEX, &commit.repo)
                        .await?;
                    for (name, _) in hits {
                        *repo_counts.entry(name.clone()).or_insert(0) += 1;
                        if !downstream.contains(&name) {
                            downstream.push(name);
                        }
                    }
                }
                downstream
                    .into_iter()
                    .filter(|name| repo_counts[name] == resolved.len())
                    .collect()
            }
        };

        let (out_tx, out_rx) = mpsc::channel(16);
        let (resp_done_tx, mut resp_done_rx) = watch::channel(false);
        if target_repos.is_empty() {
            // Nothing downstream: the stream closes immediately.
            drop(out_tx);
            return Ok(CommitStream {
                rx: out_rx,
                done: resp_done_tx,
            });
        }

        let (in_tx, mut in_rx) = mpsc::channel::<Result<CommitInfo>>(target_repos.len());
        let (done_tx, done_rx) = watch::channel(false);

        // A commit must show up once per input commit to prove its
        // provenance covers them all.
        let commit_counts: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let needed = resolved.len();

        for commit in &resolved {
            for repo in &target_repos {
                let mut watcher = self
                    .commits(repo)
                    .read_only()
                    .watch_by_index(PROVENANCE_INDEX, &commit_token(commit))
                    .await;
                let tx = in_tx.clone();
                let mut done = done_rx.clone();
                let counts = commit_counts.clone();
                tokio::spawn(async move {
                    let result: Result<()> = async {
                        loop {
                            let event = tokio::select! {
                                ev = watcher.next() => ev,
                                _ = done_wait(&mut done) => return Ok(()),
                            };
                            let record: CommitInfo = match event {
                                Some(WatchEvent::Put { value, .. }) => {
                                    postcard::from_bytes(&value).map_err(atoll_kv::KvError::from)?
                                }
                                Some(WatchEvent::Delete { .. }) => continue,
                                None => return Ok(()),
                            };
                            let ready = {
                                let mut counts = counts.lock().expect("counts lock poisoned");
                                let count = counts.entry(record.commit.id.clone()).or_insert(0);
                                *count += 1;
                                *count == needed
                            };
                            if ready {
                                debug!(commit = %record.commit, "flush matched downstream commit");
                                let sent = tokio::select! {
                                    sent = tx.send(Ok(record)) => sent.is_ok(),
                                    _ = done_wait(&mut done) => false,
                                };
                                if !sent {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    .await;
                    if let Err(e) = result {
                        let _ = tx.send(Err(e)).await;
                    }
                });
            }
        }
        drop(in_tx);

        // Forward one commit per downstream repo, then close everything.
        let total = target_repos.len();
        tokio::spawn(async move {
            let mut sent = 0;
            loop {
                tokio::select! {
                    event = in_rx.recv() => {
                        let Some(event) = event else { break };
                        if out_tx.send(event).await.is_err() {
                            break;
                        }
                        sent += 1;
                        if sent == total {
                            break;
                        }
                    }
                    _ = done_wait(&mut resp_done_rx) => break,
                }
            }
            let _ = done_tx.send(true);
        });

        Ok(CommitStream {
            rx: out_rx,
            done: resp_done_tx,
        })
    }
}
