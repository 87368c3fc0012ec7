//! Repository operations: create, update, inspect, list, delete.

use std::collections::BTreeSet;

use atoll_auth::Acl;
use atoll_types::{unix_now, RepoAuthInfo, RepoInfo, Scope};
use tracing::{debug, info};

use crate::driver::{validate_repo_name, Driver};
use crate::error::{EngineError, Result};

impl Driver {
    /// Create a repository.
    ///
    /// `provenance` names the direct upstream repos; the stored record
    /// carries their transitive closure, and each closure member's
    /// reference count is incremented. With `update`, an existing repo's
    /// provenance and description are rewritten instead.
    pub async fn create_repo(
        &self,
        repo: &str,
        provenance: &[String],
        description: &str,
        update: bool,
    ) -> Result<()> {
        validate_repo_name(repo)?;
        if update {
            return self.update_repo(repo, provenance, description).await;
        }

        // Check existence before the auth calls so creating a repo that
        // already exists fails with the right error rather than an
        // access-denied one.
        if self.repos.read_only().get(repo).await.is_ok() {
            return Err(EngineError::RepoExists(repo.to_string()));
        }

        // When auth is active, make the caller the owner of the new repo
        // (clearing any stale ACL under this name).
        match self.auth.who_am_i().await {
            Ok(who) => {
                let mut acl = Acl::default();
                acl.entries.insert(who.username, Scope::Owner);
                self.auth
                    .set_acl(repo, Some(acl))
                    .await
                    .map_err(EngineError::Auth)?;
            }
            Err(e) if e.is_not_activated() => {}
            Err(e) => return Err(EngineError::Auth(e)),
        }

        let repo = repo.to_string();
        let provenance = provenance.to_vec();
        let description = description.to_string();
        self.kv
            .stm(|stm| {
                if stm.get(&self.repos.path(&repo)).is_some() {
                    return Err(EngineError::RepoExists(repo.clone()));
                }

                // The provenance of my provenance is my provenance.
                let mut full_prov = BTreeSet::new();
                for prov in &provenance {
                    let prov_info = self.repos.read_write(stm).get(prov).map_err(|e| {
                        if e.is_not_found() {
                            EngineError::RepoNotFound(prov.clone())
                        } else {
                            e.into()
                        }
                    })?;
                    full_prov.insert(prov.clone());
                    full_prov.extend(prov_info.provenance);
                }

                for prov in &full_prov {
                    self.repo_ref_counts.read_write_int(stm).increment(prov)?;
                }
                self.repo_ref_counts.read_write_int(stm).create(&repo, 0)?;

                let record = RepoInfo {
                    repo: repo.clone(),
                    created: unix_now(),
                    description: description.clone(),
                    provenance: full_prov.iter().cloned().collect(),
                    size_bytes: 0,
                    auth_info: None,
                };
                self.repos.read_write(stm).create(&repo, &record)?;
                Ok(())
            })
            .await?;
        info!(%repo, "created repo");
        Ok(())
    }

    /// Rewrite a repo's provenance and description.
    ///
    /// This is the only path that re-propagates provenance through
    /// already-created downstream repos: members entering or leaving the
    /// closure have their refcounts adjusted by this repo's own refcount
    /// plus one (self-inclusive), and every downstream repo's stored
    /// closure is patched to match.
    async fn update_repo(&self, repo: &str, provenance: &[String], description: &str) -> Result<()> {
        self.check_authorized(repo, Scope::Writer).await?;

        let repo = repo.to_string();
        let provenance = provenance.to_vec();
        let description = description.to_string();
        self.kv
            .stm(|stm| {
                let mut record = self.repos.read_write(stm).get(&repo).map_err(|e| {
                    if e.is_not_found() {
                        EngineError::RepoNotFound(repo.clone())
                    } else {
                        e.into()
                    }
                })?;

                let mut new_prov = BTreeSet::new();
                for prov in &provenance {
                    let prov_info = self.repos.read_write(stm).get(prov).map_err(|e| {
                        if e.is_not_found() {
                            EngineError::RepoNotFound(prov.clone())
                        } else {
                            e.into()
                        }
                    })?;
                    new_prov.insert(prov.clone());
                    new_prov.extend(prov_info.provenance);
                }
                let old_prov: BTreeSet<String> = record.provenance.iter().cloned().collect();
                let to_add: Vec<&String> = new_prov.difference(&old_prov).collect();
                let to_remove: Vec<&String> = old_prov.difference(&new_prov).collect();

                // Each entering/leaving closure member is referenced once
                // by this repo and once per repo downstream of it.
                let my_ref_count = self.repo_ref_counts.read_write_int(stm).get(&repo)? + 1;
                for prov in &to_add {
                    self.repo_ref_counts
                        .read_write_int(stm)
                        .increment_by(prov, my_ref_count)?;
                }
                for prov in &to_remove {
                    self.repo_ref_counts
                        .read_write_int(stm)
                        .decrement_by(prov, my_ref_count)?;
                }

                // Patch the closures of downstream repos.
                let all = self.repos.read_write(stm).list()?;
                for (name, mut downstream) in all {
                    if name == repo || !downstream.provenance.contains(&repo) {
                        continue;
                    }
                    for prov in &to_add {
                        if !downstream.provenance.contains(prov) {
                            downstream.provenance.push((*prov).clone());
                        }
                    }
                    downstream
                        .provenance
                        .retain(|p| !to_remove.contains(&p));
                    downstream.provenance.sort();
                    self.repos.read_write(stm).put(&name, &downstream)?;
                }

                record.description = description.clone();
                record.provenance = new_prov.iter().cloned().collect();
                self.repos.read_write(stm).put(&repo, &record)?;
                Ok::<(), EngineError>(())
            })
            .await?;
        info!(%repo, "updated repo");
        Ok(())
    }

    /// Fetch one repo's metadata.
    ///
    /// With `include_auth`, the caller's access level is attached when the
    /// auth subsystem is active.
    pub async fn inspect_repo(&self, repo: &str, include_auth: bool) -> Result<RepoInfo> {
        let mut record = self.repos.read_only().get(repo).await.map_err(|e| {
            if e.is_not_found() {
                EngineError::RepoNotFound(repo.to_string())
            } else {
                e.into()
            }
        })?;
        if include_auth {
            match self.access_level(repo).await {
                Ok(level) => {
                    record.auth_info = Some(RepoAuthInfo {
                        access_level: level,
                    })
                }
                Err(e) if e.is_not_activated() => {}
                Err(e) => return Err(EngineError::Auth(e)),
            }
        }
        Ok(record)
    }

    /// List repos, newest first.
    ///
    /// A repo is included only if *every* entry of `provenance` is a
    /// member of its closure. With `include_auth`, access levels are
    /// attached per entry until the first probe reports the subsystem
    /// inactive.
    pub async fn list_repo(&self, provenance: &[String], include_auth: bool) -> Result<Vec<RepoInfo>> {
        // All requested provenance repos must exist.
        for prov in provenance {
            self.repos.read_only().get(prov).await.map_err(|e| {
                if e.is_not_found() {
                    EngineError::RepoNotFound(prov.clone())
                } else {
                    e.into()
                }
            })?;
        }

        let mut result = Vec::new();
        let mut auth_seems_active = true;
        for (name, mut record) in self.repos.read_only().list().await? {
            if !provenance.iter().all(|p| record.provenance.contains(p)) {
                continue;
            }
            if include_auth && auth_seems_active {
                match self.access_level(&name).await {
                    Ok(level) => {
                        record.auth_info = Some(RepoAuthInfo {
                            access_level: level,
                        })
                    }
                    Err(e) if e.is_not_activated() => auth_seems_active = false,
                    Err(e) => return Err(EngineError::Auth(e)),
                }
            }
            result.push(record);
        }
        Ok(result)
    }

    /// Delete a repo along with its commits and branches.
    ///
    /// Unless `force` is given, deletion is refused while other repos
    /// reference this one in their provenance. Refcounts of upstream
    /// repos are decremented, tolerating already-deleted entries so
    /// chained force-deletes work.
    pub async fn delete_repo(&self, repo: &str, force: bool) -> Result<()> {
        self.check_authorized(repo, Scope::Owner).await?;

        let repo = repo.to_string();
        self.kv
            .stm(|stm| {
                if !force {
                    let ref_count = self.repo_ref_counts.read_write_int(stm).get(&repo)?;
                    if ref_count != 0 {
                        return Err(EngineError::HasDownstream(repo.clone()));
                    }
                }
                let record = self.repos.read_write(stm).get(&repo).map_err(|e| {
                    if e.is_not_found() {
                        EngineError::RepoNotFound(repo.clone())
                    } else {
                        e.into()
                    }
                })?;
                for prov in &record.provenance {
                    match self.repo_ref_counts.read_write_int(stm).decrement(prov) {
                        Ok(()) => {}
                        // The provenance repo may already be gone via a
                        // forced delete.
                        Err(e) if e.is_not_found() => {
                            debug!(%prov, "provenance repo already deleted");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                self.repos.read_write(stm).delete(&repo)?;
                self.repo_ref_counts.read_write_int(stm).delete(&repo)?;
                self.commits(&repo).read_write(stm).delete_all();
                self.branches(&repo).read_write(stm).delete_all();
                Ok(())
            })
            .await?;

        match self.auth.set_acl(&repo, None).await {
            Ok(()) => {}
            Err(e) if e.is_not_activated() => {}
            Err(e) => return Err(EngineError::Auth(e)),
        }
        info!(%repo, force, "deleted repo");
        Ok(())
    }
}
