//! The driver: shared state and cross-cutting helpers.

use std::sync::Arc;

use atoll_auth::{AuthClient, AuthError};
use atoll_cas::ObjectStore;
use atoll_kv::{Collection, Index, KvStore};
use atoll_types::{CommitInfo, CommitRef, RepoInfo, Scope};
use tracing::warn;

use crate::cache::TreeCache;
use crate::error::{EngineError, Result};

/// Scratch value marking "delete this path at finish time".
pub(crate) const TOMBSTONE: &[u8] = b"delete";

/// Name of the provenance secondary index on the repo and commit
/// collections.
pub(crate) const PROVENANCE_INDEX: &str = "provenance";

/// Index token for a commit: `<repo>@<id>`. `@` keeps the token free of
/// the key separator.
pub(crate) fn commit_token(commit: &CommitRef) -> String {
    format!("{}@{}", commit.repo, commit.id)
}

fn repo_provenance(info: &RepoInfo) -> Vec<String> {
    info.provenance.clone()
}

fn commit_provenance(info: &CommitInfo) -> Vec<String> {
    info.provenance.iter().map(commit_token).collect()
}

/// Configuration for creating a [`Driver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Install-wide key prefix in the coordination store.
    pub prefix: String,
    /// Capacity of the finished-tree LRU cache.
    pub tree_cache_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            prefix: "pfs".to_string(),
            tree_cache_capacity: 128,
        }
    }
}

/// The metadata and commit engine.
///
/// Owns typed collections over the coordination store plus clients for
/// the external object store and auth service. Cheap to clone; clones
/// share all state, which is what the streaming tasks rely on.
#[derive(Clone)]
pub struct Driver {
    pub(crate) kv: KvStore,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) auth: Arc<dyn AuthClient>,
    pub(crate) prefix: String,
    pub(crate) repos: Collection<RepoInfo>,
    pub(crate) repo_ref_counts: Collection<i64>,
    pub(crate) open_commits: Collection<CommitRef>,
    pub(crate) tree_cache: Arc<TreeCache>,
}

impl Driver {
    /// Create a driver over the given stores.
    pub fn new(
        kv: KvStore,
        objects: Arc<dyn ObjectStore>,
        auth: Arc<dyn AuthClient>,
        config: DriverConfig,
    ) -> Self {
        let prefix = config.prefix;
        let repos = Collection::new(kv.clone(), format!("{prefix}/repos")).with_index(Index {
            name: PROVENANCE_INDEX,
            extract: repo_provenance,
        });
        let repo_ref_counts = Collection::new(kv.clone(), format!("{prefix}/repoRefCounts"));
        let open_commits = Collection::new(kv.clone(), format!("{prefix}/openCommits"));
        Self {
            kv,
            objects,
            auth,
            prefix,
            repos,
            repo_ref_counts,
            open_commits,
            tree_cache: Arc::new(TreeCache::new(config.tree_cache_capacity)),
        }
    }

    /// The per-repo commit collection, with its provenance index.
    pub(crate) fn commits(&self, repo: &str) -> Collection<CommitInfo> {
        Collection::new(self.kv.clone(), format!("{}/commits/{repo}", self.prefix)).with_index(
            Index {
                name: PROVENANCE_INDEX,
                extract: commit_provenance,
            },
        )
    }

    /// The per-repo branch collection: branch name → head commit.
    pub(crate) fn branches(&self, repo: &str) -> Collection<CommitRef> {
        Collection::new(self.kv.clone(), format!("{}/branches/{repo}", self.prefix))
    }

    /// Error unless the caller holds `scope` on `repo`.
    ///
    /// An inactive auth subsystem reads as permit-all.
    pub(crate) async fn check_authorized(&self, repo: &str, scope: Scope) -> Result<()> {
        match self.auth.authorize(repo, scope).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(EngineError::NotAuthorized {
                repo: repo.to_string(),
                required: scope,
            }),
            Err(e) if e.is_not_activated() => Ok(()),
            Err(e) => Err(EngineError::Auth(e)),
        }
    }

    /// The caller's access level on `repo`.
    ///
    /// Propagates [`AuthError::NotActivated`] so callers can stop probing.
    pub(crate) async fn access_level(&self, repo: &str) -> std::result::Result<Scope, AuthError> {
        let who = self.auth.who_am_i().await?;
        if who.is_admin {
            return Ok(Scope::Owner);
        }
        let scopes = self.auth.get_scope(&[repo.to_string()]).await?;
        match scopes.as_slice() {
            [scope] => Ok(*scope),
            other => Err(AuthError::Rejected(format!(
                "expected one scope from get_scope, got {}",
                other.len()
            ))),
        }
    }

    /// Root of the scratch key space.
    pub(crate) fn scratch_prefix(&self) -> String {
        format!("{}/scratch", self.prefix)
    }

    /// Scratch prefix for one open commit.
    pub(crate) fn scratch_commit_prefix(&self, repo: &str, commit_id: &str) -> String {
        format!("{}/{repo}/{commit_id}", self.scratch_prefix())
    }

    /// Scratch prefix for one file path within an open commit.
    pub(crate) fn scratch_file_prefix(&self, repo: &str, commit_id: &str, path: &str) -> String {
        format!(
            "{}{}",
            self.scratch_commit_prefix(repo, commit_id),
            atoll_hashtree::clean_path(path)
        )
    }

    /// Recover the file path from a scratch key.
    ///
    /// Keys have the shape `<prefix>/scratch/<repo>/<commit>/<path...>/<uuid>`;
    /// the three leading components after the scratch prefix and the
    /// trailing uuid are stripped.
    pub(crate) fn file_path_from_scratch_key(&self, key: &str) -> String {
        let trimmed = key
            .strip_prefix(&format!("{}/", self.scratch_prefix()))
            .unwrap_or(key);
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() < 3 {
            return String::new();
        }
        parts[2..parts.len() - 1].join("/")
    }

    /// Force-delete every repo, ignoring per-repo authorization failures.
    pub async fn delete_all(&self) -> Result<()> {
        for info in self.list_repo(&[], false).await? {
            match self.delete_repo(&info.repo, true).await {
                Ok(()) => {}
                Err(EngineError::NotAuthorized { repo, .. }) => {
                    warn!(%repo, "skipping repo during delete_all: not authorized");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Validate a repo name: `[a-zA-Z0-9_-]+`.
pub(crate) fn validate_repo_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidRepoName(name.to_string()))
    }
}

/// Validate a file path: no NUL bytes.
pub(crate) fn check_path(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(EngineError::InvalidPath(path.to_string()));
    }
    Ok(())
}
