//! Branch operations: named head pointers over commits.

use atoll_types::{BranchInfo, CommitRef, Scope};
use tracing::info;

use crate::driver::Driver;
use crate::error::{EngineError, Result};

impl Driver {
    /// List a repo's branches and their heads, newest first.
    pub async fn list_branch(&self, repo: &str) -> Result<Vec<BranchInfo>> {
        self.check_authorized(repo, Scope::Reader).await?;
        Ok(self
            .branches(repo)
            .read_only()
            .list()
            .await?
            .into_iter()
            .map(|(name, head)| BranchInfo { name, head })
            .collect())
    }

    /// Point a branch at a commit, creating the branch if needed.
    pub async fn set_branch(&self, commit: &CommitRef, name: &str) -> Result<()> {
        self.check_authorized(&commit.repo, Scope::Writer).await?;
        // Resolve branch names and ancestry syntax up front; the
        // transaction then re-verifies the concrete commit.
        let resolved = self.inspect_commit(commit).await?.commit;
        let repo = resolved.repo.clone();
        let name = name.to_string();
        self.kv
            .stm(|stm| {
                self.commits(&repo)
                    .read_write(stm)
                    .get(&resolved.id)
                    .map_err(|e| {
                        if e.is_not_found() {
                            EngineError::CommitNotFound(resolved.clone())
                        } else {
                            e.into()
                        }
                    })?;
                self.branches(&repo).read_write(stm).put(&name, &resolved)?;
                Ok::<(), EngineError>(())
            })
            .await?;
        info!(branch = %name, commit = %resolved, "set branch");
        Ok(())
    }

    /// Delete a branch pointer. The commits it pointed at are untouched.
    pub async fn delete_branch(&self, repo: &str, name: &str) -> Result<()> {
        self.check_authorized(repo, Scope::Writer).await?;
        let repo = repo.to_string();
        let name_owned = name.to_string();
        self.kv
            .stm(|stm| {
                self.branches(&repo)
                    .read_write(stm)
                    .delete(&name_owned)
                    .map_err(|e| {
                        if e.is_not_found() {
                            EngineError::BranchNotFound {
                                repo: repo.clone(),
                                name: name_owned.clone(),
                            }
                        } else {
                            e.into()
                        }
                    })
            })
            .await?;
        info!(branch = %name, %repo, "deleted branch");
        Ok(())
    }
}
