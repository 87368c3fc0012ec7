//! Authorization client contract.
//!
//! Authorization is delegated to an external service; this crate defines
//! the client interface the engine calls before every operation, plus two
//! implementations: [`InactiveAuth`] (the subsystem is not activated —
//! every check reads as permit-all) and [`MemoryAuth`] (an in-process ACL
//! table for tests and single-node use).
//!
//! Callers must treat [`AuthError::NotActivated`] as "permit" on a
//! per-call basis: the subsystem can be activated at any time, so the
//! state is probed on every check rather than cached.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use atoll_types::Scope;
use tracing::debug;

/// Errors returned by [`AuthClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The auth subsystem is not activated; checks read as permit-all.
    #[error("the auth service is not activated")]
    NotActivated,

    /// The auth service rejected the call outright (e.g. no identity).
    #[error("auth error: {0}")]
    Rejected(String),
}

impl AuthError {
    /// Whether this error means the subsystem is inactive.
    pub fn is_not_activated(&self) -> bool {
        matches!(self, AuthError::NotActivated)
    }
}

/// The calling identity, as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmI {
    /// User name.
    pub username: String,
    /// Admins hold OWNER on every repo.
    pub is_admin: bool,
}

/// Access-control list for one repo: user name → scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    /// Per-user access levels.
    pub entries: HashMap<String, Scope>,
}

/// Contract for the external authorization service.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Whether the caller holds at least `scope` on `repo`.
    async fn authorize(&self, repo: &str, scope: Scope) -> Result<bool, AuthError>;

    /// The calling identity.
    async fn who_am_i(&self) -> Result<WhoAmI, AuthError>;

    /// Replace the ACL for `repo`. `None` clears it.
    async fn set_acl(&self, repo: &str, acl: Option<Acl>) -> Result<(), AuthError>;

    /// The caller's scope on each of `repos`, in order.
    async fn get_scope(&self, repos: &[String]) -> Result<Vec<Scope>, AuthError>;
}

/// Auth client for deployments without an activated auth subsystem.
///
/// Every call returns [`AuthError::NotActivated`], which callers treat as
/// permit-all.
#[derive(Debug, Default)]
pub struct InactiveAuth;

#[async_trait]
impl AuthClient for InactiveAuth {
    async fn authorize(&self, _repo: &str, _scope: Scope) -> Result<bool, AuthError> {
        Err(AuthError::NotActivated)
    }

    async fn who_am_i(&self) -> Result<WhoAmI, AuthError> {
        Err(AuthError::NotActivated)
    }

    async fn set_acl(&self, _repo: &str, _acl: Option<Acl>) -> Result<(), AuthError> {
        Err(AuthError::NotActivated)
    }

    async fn get_scope(&self, _repos: &[String]) -> Result<Vec<Scope>, AuthError> {
        Err(AuthError::NotActivated)
    }
}

/// In-process auth backend holding ACLs in memory.
pub struct MemoryAuth {
    user: RwLock<String>,
    admins: RwLock<HashSet<String>>,
    acls: RwLock<HashMap<String, Acl>>,
}

impl MemoryAuth {
    /// Create a backend with the given calling user.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: RwLock::new(user.into()),
            admins: RwLock::new(HashSet::new()),
            acls: RwLock::new(HashMap::new()),
        }
    }

    /// Grant admin to a user.
    pub fn add_admin(&self, user: impl Into<String>) {
        self.admins.write().expect("lock poisoned").insert(user.into());
    }

    /// Switch the calling user.
    pub fn set_user(&self, user: impl Into<String>) {
        *self.user.write().expect("lock poisoned") = user.into();
    }

    fn scope_for(&self, user: &str, repo: &str) -> Scope {
        if self.admins.read().expect("lock poisoned").contains(user) {
            return Scope::Owner;
        }
        self.acls
            .read()
            .expect("lock poisoned")
            .get(repo)
            .and_then(|acl| acl.entries.get(user).copied())
            .unwrap_or(Scope::None)
    }
}

#[async_trait]
impl AuthClient for MemoryAuth {
    async fn authorize(&self, repo: &str, scope: Scope) -> Result<bool, AuthError> {
        let user = self.user.read().expect("lock poisoned").clone();
        let held = self.scope_for(&user, repo);
        debug!(%user, %repo, required = %scope, held = %held, "authorization check");
        Ok(held >= scope)
    }

    async fn who_am_i(&self) -> Result<WhoAmI, AuthError> {
        let username = self.user.read().expect("lock poisoned").clone();
        let is_admin = self
            .admins
            .read()
            .expect("lock poisoned")
            .contains(&username);
        Ok(WhoAmI { username, is_admin })
    }

    async fn set_acl(&self, repo: &str, acl: Option<Acl>) -> Result<(), AuthError> {
        let mut acls = self.acls.write().expect("lock poisoned");
        match acl {
            Some(acl) => {
                acls.insert(repo.to_string(), acl);
            }
            None => {
                acls.remove(repo);
            }
        }
        Ok(())
    }

    async fn get_scope(&self, repos: &[String]) -> Result<Vec<Scope>, AuthError> {
        let user = self.user.read().expect("lock poisoned").clone();
        Ok(repos.iter().map(|r| self.scope_for(&user, r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inactive_auth_reports_not_activated() {
        let auth = InactiveAuth;
        let err = auth.authorize("r", Scope::Reader).await.unwrap_err();
        assert!(err.is_not_activated());
    }

    #[tokio::test]
    async fn test_acl_scopes() {
        let auth = MemoryAuth::new("alice");
        let mut acl = Acl::default();
        acl.entries.insert("alice".into(), Scope::Writer);
        auth.set_acl("r", Some(acl)).await.unwrap();

        assert!(auth.authorize("r", Scope::Reader).await.unwrap());
        assert!(auth.authorize("r", Scope::Writer).await.unwrap());
        assert!(!auth.authorize("r", Scope::Owner).await.unwrap());
        assert!(!auth.authorize("other", Scope::Reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_holds_owner_everywhere() {
        let auth = MemoryAuth::new("root");
        auth.add_admin("root");
        assert!(auth.authorize("anything", Scope::Owner).await.unwrap());
        assert!(auth.who_am_i().await.unwrap().is_admin);
    }

    #[tokio::test]
    async fn test_clearing_acl_revokes() {
        let auth = MemoryAuth::new("bob");
        let mut acl = Acl::default();
        acl.entries.insert("bob".into(), Scope::Owner);
        auth.set_acl("r", Some(acl)).await.unwrap();
        assert!(auth.authorize("r", Scope::Owner).await.unwrap());

        auth.set_acl("r", None).await.unwrap();
        assert!(!auth.authorize("r", Scope::Reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_scope_per_repo() {
        let auth = MemoryAuth::new("carol");
        let mut acl = Acl::default();
        acl.entries.insert("carol".into(), Scope::Reader);
        auth.set_acl("a", Some(acl)).await.unwrap();
        let scopes = auth
            .get_scope(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(scopes, vec![Scope::Reader, Scope::None]);
    }
}
