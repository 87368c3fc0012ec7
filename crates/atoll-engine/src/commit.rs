//! Commit operations: construction, finishing, inspection, listing,
//! deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use atoll_hashtree::HashTree;
use atoll_kv::Stm;
use atoll_types::{new_commit_id, unix_now, CommitInfo, CommitRef, ObjectHash, Scope};
use tracing::{debug, info};

use crate::driver::Driver;
use crate::error::{EngineError, Result};
use crate::file::size_change;

/// Split a commit reference into its leading token and ancestry depth.
///
/// Accepts git-style ancestry syntax: `master^2`, `master~~`, `master^^`,
/// `master~5`. Returns the token (`master`) and the number of parent
/// links to walk. A reference with no separator — or with a malformed
/// suffix such as `master~x` — comes back unchanged with depth 0.
pub fn parse_commit_id(id: &str) -> (String, usize) {
    let Some(sep_index) = id.find(['^', '~']) else {
        return (id.to_string(), 0);
    };
    let sep = id.as_bytes()[sep_index];
    let after = &id[sep_index + 1..];

    if let Ok(n) = after.parse::<usize>() {
        return (id[..sep_index].to_string(), n);
    }
    if after.bytes().all(|b| b == sep) {
        // A run of identical separators: the depth is its length.
        return (id[..sep_index].to_string(), id.len() - sep_index);
    }
    (id.to_string(), 0)
}

impl Driver {
    /// Resolve a commit reference inside a transaction.
    ///
    /// The leading token is first tested as a branch name and rewritten to
    /// the branch head; the ancestry suffix then walks parent links. A nil
    /// link before the walk completes is a `CommitNotFound`.
    pub(crate) fn resolve_commit_in_stm(
        &self,
        stm: &mut Stm,
        repo: &str,
        id: &str,
    ) -> Result<CommitInfo> {
        let (token, ancestry) = parse_commit_id(id);

        let mut commit_id = token.clone();
        match self.branches(repo).read_write(stm).get(&token) {
            Ok(head) => commit_id = head.id,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let commits = self.commits(repo);
        let mut record = commits.read_write(stm).get(&commit_id).map_err(|e| {
            if e.is_not_found() {
                EngineError::CommitNotFound(CommitRef::new(repo, id))
            } else {
                e.into()
            }
        })?;
        for _ in 0..ancestry {
            let parent = record
                .parent_commit
                .clone()
                .ok_or_else(|| EngineError::CommitNotFound(CommitRef::new(repo, id)))?;
            record = commits.read_write(stm).get(&parent.id).map_err(|e| {
                if e.is_not_found() {
                    EngineError::CommitNotFound(parent.clone())
                } else {
                    e.into()
                }
            })?;
        }
        Ok(record)
    }

    /// Resolve a commit reference (UUID, branch name, or ancestry
    /// expression) to its metadata record.
    pub async fn inspect_commit(&self, commit: &CommitRef) -> Result<CommitInfo> {
        self.check_authorized(&commit.repo, Scope::Reader).await?;
        let repo = commit.repo.clone();
        let id = commit.id.clone();
        self.kv
            .stm(|stm| self.resolve_commit_in_stm(stm, &repo, &id))
            .await
    }

    /// Open a new commit.
    ///
    /// `parent.repo` names the repo; `parent.id` may be empty, in which
    /// case a non-empty `branch`'s current head becomes the parent. The
    /// branch head (if given) advances to the new commit.
    pub async fn start_commit(
        &self,
        parent: CommitRef,
        branch: &str,
        provenance: &[CommitRef],
    ) -> Result<CommitRef> {
        self.make_commit(parent, branch, provenance, None).await
    }

    /// Create an already-finished commit from a prefabricated snapshot
    /// tree, as produced by pipeline outputs.
    pub async fn build_commit(
        &self,
        parent: CommitRef,
        branch: &str,
        provenance: &[CommitRef],
        tree: ObjectHash,
    ) -> Result<CommitRef> {
        self.make_commit(parent, branch, provenance, Some(tree)).await
    }

    async fn make_commit(
        &self,
        parent: CommitRef,
        branch: &str,
        provenance: &[CommitRef],
        tree_ref: Option<ObjectHash>,
    ) -> Result<CommitRef> {
        self.check_authorized(&parent.repo, Scope::Writer).await?;
        let repo = parent.repo.clone();
        let commit = CommitRef::new(repo.clone(), new_commit_id());

        // A supplied tree is fetched and deserialized before the
        // transaction; only the reference is committed.
        let supplied_tree: Option<HashTree> = match &tree_ref {
            Some(hash) => {
                let data = self.objects.get_object(hash, 0, 0).await?;
                Some(HashTree::deserialize(&data)?)
            }
            None => None,
        };

        enum Outcome {
            Done,
            Raced,
        }

        loop {
            // Prefetch the probable parent and its snapshot. The
            // transaction re-resolves the parent and sends us back here
            // if a concurrent writer moved the branch head in between.
            let mut expected_parent: Option<CommitRef> = None;
            if !parent.id.is_empty() {
                expected_parent = Some(self.inspect_commit(&parent).await?.commit);
            } else if !branch.is_empty() {
                match self.branches(&repo).read_only().get(branch).await {
                    Ok(head) => expected_parent = Some(head),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let parent_tree: Option<Arc<HashTree>> = match &supplied_tree {
                Some(_) => Some(self.get_tree_for_commit(expected_parent.as_ref()).await?),
                None => None,
            };

            let outcome = self
                .kv
                .stm(|stm| {
                    let mut repo_info = self.repos.read_write(stm).get(&repo).map_err(|e| {
                        if e.is_not_found() {
                            EngineError::RepoNotFound(repo.clone())
                        } else {
                            e.into()
                        }
                    })?;

                    // Full provenance: the provenance of my provenance is
                    // my provenance, deduplicated by commit ID.
                    let mut prov_map: BTreeMap<String, CommitRef> = BTreeMap::new();
                    for prov in provenance {
                        let prov_info = self
                            .commits(&prov.repo)
                            .read_write(stm)
                            .get(&prov.id)
                            .map_err(|e| {
                                if e.is_not_found() {
                                    EngineError::CommitNotFound(prov.clone())
                                } else {
                                    e.into()
                                }
                            })?;
                        for c in prov_info.provenance {
                            prov_map.insert(c.id.clone(), c);
                        }
                    }
                    for prov in provenance {
                        prov_map.insert(prov.id.clone(), prov.clone());
                    }

                    // An explicit parent wins; otherwise the branch head.
                    let resolved_parent: Option<CommitInfo> = if !parent.id.is_empty() {
                        Some(self.resolve_commit_in_stm(stm, &repo, &parent.id)?)
                    } else if !branch.is_empty() {
                        match self.branches(&repo).read_write(stm).get(branch) {
                            Ok(head) => Some(self.resolve_commit_in_stm(stm, &repo, &head.id)?),
                            Err(e) if e.is_not_found() => None,
                            Err(e) => return Err(e.into()),
                        }
                    } else {
                        None
                    };

                    if supplied_tree.is_some() {
                        let actual = resolved_parent.as_ref().map(|i| i.commit.id.as_str());
                        let expected = expected_parent.as_ref().map(|c| c.id.as_str());
                        if actual != expected {
                            return Ok(Outcome::Raced);
                        }
                    }

                    if let Some(parent_info) = &resolved_parent {
                        if parent_info.finished.is_none() {
                            return Err(EngineError::ParentNotFinished(parent_info.commit.clone()));
                        }
                    }

                    let mut record = CommitInfo {
                        commit: commit.clone(),
                        started: unix_now(),
                        finished: None,
                        parent_commit: resolved_parent.as_ref().map(|i| i.commit.clone()),
                        provenance: prov_map.values().cloned().collect(),
                        tree: None,
                        size_bytes: 0,
                    };

                    if !branch.is_empty() {
                        self.branches(&repo).read_write(stm).put(branch, &commit)?;
                    }

                    if let (Some(hash), Some(tree), Some(parent_tree)) =
                        (&tree_ref, &supplied_tree, &parent_tree)
                    {
                        record.tree = Some(*hash);
                        record.size_bytes = tree.fs_size().max(0) as u64;
                        record.finished = Some(unix_now());
                        repo_info.size_bytes += size_change(tree, parent_tree);
                        self.repos.read_write(stm).put(&repo, &repo_info)?;
                    } else {
                        self.open_commits.read_write(stm).put(&commit.id, &commit)?;
                    }
                    self.commits(&repo).read_write(stm).create(&commit.id, &record)?;
                    Ok(Outcome::Done)
                })
                .await?;

            match outcome {
                Outcome::Done => {
                    debug!(commit = %commit, branch, "created commit");
                    return Ok(commit);
                }
                Outcome::Raced => continue,
            }
        }
    }

    /// Finish an open commit: fold its scratch records onto the parent
    /// snapshot, store the sealed tree, and publish the result.
    ///
    /// The tree object is written to the object store *before* the
    /// transaction; a crash in between leaves an orphaned object, never a
    /// half-finished commit. The scratch prefix is cleared last.
    pub async fn finish_commit(&self, commit: &CommitRef) -> Result<()> {
        self.check_authorized(&commit.repo, Scope::Writer).await?;
        let mut record = self.inspect_commit(commit).await?;
        if record.finished.is_some() {
            return Err(EngineError::CommitFinished(record.commit.clone()));
        }
        let repo = record.commit.repo.clone();
        let id = record.commit.id.clone();

        // Scratch records replay in mod-revision order: the total write
        // order within the commit.
        let scratch_prefix = format!("{}/", self.scratch_commit_prefix(&repo, &id));
        let scratch = self.kv.list_prefix_by_mod_revision(&scratch_prefix).await;

        let parent_tree = self.get_tree_for_commit(record.parent_commit.as_ref()).await?;
        let mut open = parent_tree.open();
        self.apply_writes(&scratch, &mut open)?;
        let finished_tree = open.finish();

        if !finished_tree.is_empty() {
            let data = finished_tree.serialize()?;
            let (hash, _) = self.objects.put_object(data).await?;
            record.tree = Some(hash);
        }
        record.size_bytes = finished_tree.fs_size().max(0) as u64;
        record.finished = Some(unix_now());

        let delta = size_change(&finished_tree, &parent_tree);
        self.kv
            .stm(|stm| {
                self.commits(&repo).read_write(stm).put(&id, &record)?;
                self.open_commits.read_write(stm).delete(&id).map_err(|e| {
                    if e.is_not_found() {
                        EngineError::Internal(format!(
                            "could not confirm that commit {id} is open; this is likely a bug"
                        ))
                    } else {
                        e.into()
                    }
                })?;
                // The repo grows by the size of the files added in this
                // commit.
                let mut repo_info = self.repos.read_write(stm).get(&repo)?;
                repo_info.size_bytes += delta;
                self.repos.read_write(stm).put(&repo, &repo_info)?;
                Ok::<(), EngineError>(())
            })
            .await?;

        self.kv.delete_prefix(&scratch_prefix).await;
        info!(commit = %record.commit, size = record.size_bytes, "finished commit");
        Ok(())
    }

    /// List commits, newest first.
    ///
    /// With `to`, parent links are walked from `to` downward, stopping at
    /// `from` (exclusive) or after `number` commits (0 = unlimited).
    /// `from` without `to` is an error.
    pub async fn list_commit(
        &self,
        repo: &str,
        from: Option<&CommitRef>,
        to: Option<&CommitRef>,
        number: u64,
    ) -> Result<Vec<CommitInfo>> {
        self.check_authorized(repo, Scope::Reader).await?;
        if from.is_some_and(|c| c.repo != repo) || to.is_some_and(|c| c.repo != repo) {
            return Err(EngineError::InvalidArgument(format!(
                "`from` and `to` commits need to be from repo {repo}"
            )));
        }
        self.inspect_repo(repo, false).await?;

        let from = match from {
            Some(c) => Some(self.inspect_commit(c).await?.commit),
            None => None,
        };
        let to = match to {
            Some(c) => Some(self.inspect_commit(c).await?.commit),
            None => None,
        };
        let mut number = if number == 0 { u64::MAX } else { number };

        let commits = self.commits(repo);
        let mut result = Vec::new();
        match (from, to) {
            (Some(_), None) => {
                return Err(EngineError::InvalidArgument(
                    "cannot use `from` commit without `to` commit".to_string(),
                ))
            }
            (None, None) => {
                for (_, record) in commits.read_only().list().await? {
                    if number == 0 {
                        break;
                    }
                    result.push(record);
                    number -= 1;
                }
            }
            (from, Some(to)) => {
                let mut cursor = Some(to);
                while number > 0 {
                    let Some(c) = cursor else { break };
                    if from.as_ref().is_some_and(|f| f.id == c.id) {
                        break;
                    }
                    let record = commits.read_only().get(&c.id).await.map_err(|e| {
                        if e.is_not_found() {
                            EngineError::CommitNotFound(c.clone())
                        } else {
                            e.into()
                        }
                    })?;
                    cursor = record.parent_commit.clone();
                    result.push(record);
                    number -= 1;
                }
            }
        }
        Ok(result)
    }

    /// Delete an open commit.
    ///
    /// Scratch is cleared, branches whose head is this commit are
    /// retargeted to its parent (or deleted when there is none), and the
    /// commit record goes away along with its contribution to the repo
    /// size. Finished commits cannot be deleted.
    pub async fn delete_commit(&self, commit: &CommitRef) -> Result<()> {
        self.check_authorized(&commit.repo, Scope::Writer).await?;
        let record = self.inspect_commit(commit).await?;
        if record.finished.is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "cannot delete finished commit {}",
                record.commit
            )));
        }
        let repo = record.commit.repo.clone();
        let id = record.commit.id.clone();

        self.kv
            .delete_prefix(&format!("{}/", self.scratch_commit_prefix(&repo, &id)))
            .await;

        self.kv
            .stm(|stm| {
                for (name, head) in self.branches(&repo).read_write(stm).list()? {
                    if head.id != id {
                        continue;
                    }
                    match &record.parent_commit {
                        Some(parent) => self.branches(&repo).read_write(stm).put(&name, parent)?,
                        None => self.branches(&repo).read_write(stm).delete(&name)?,
                    }
                }
                let mut repo_info = self.repos.read_write(stm).get(&repo)?;
                repo_info.size_bytes = repo_info.size_bytes.saturating_sub(record.size_bytes);
                self.repos.read_write(stm).put(&repo, &repo_info)?;
                self.commits(&repo).read_write(stm).delete(&id)?;
                match self.open_commits.read_write(stm).delete(&id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err::<(), EngineError>(e.into()),
                }
                Ok::<(), EngineError>(())
            })
            .await?;
        info!(commit = %record.commit, "deleted commit");
        Ok(())
    }
}
