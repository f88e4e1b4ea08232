use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::action::{
    REPO_CREATE, REPO_DELETE, REPO_INVITE, REPO_OWNER, REPO_PUSH, REPO_SETTINGS, SERVER_INVITE,
};
use super::{Policy, PolicyBackend, SqlitePolicyStore, SERVER_MEMBER, SERVER_OWNER};
use crate::db::{Db, StoreError};

/// Authorization queries and provisioning on top of a [`PolicyBackend`].
#[derive(Clone)]
pub struct Enforcer {
    backend: Arc<dyn PolicyBackend>,
}

impl Enforcer {
    pub fn new(backend: Arc<dyn PolicyBackend>) -> Self {
        Self { backend }
    }

    /// Enforcer over the SQLite store in `db`.
    pub fn sqlite(db: Db) -> Self {
        Self::new(Arc::new(SqlitePolicyStore::new(db)))
    }

    pub fn enforce(
        &self,
        subject: &str,
        domain: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, StoreError> {
        let allowed = self.backend.enforce(subject, domain, object, action)?;
        debug!(%subject, %domain, %object, %action, allowed, "policy decision");
        Ok(allowed)
    }

    // -----------------------------------------------------------------------
    // Provisioning
    // -----------------------------------------------------------------------

    /// Seed the base policy of a knot: owners may invite, members may create
    /// repositories, and every owner is a member.
    #[instrument(skip(self))]
    pub fn add_domain(&self, domain: &str) -> Result<(), StoreError> {
        self.backend.add_policies(&[
            Policy::new(SERVER_OWNER, domain, domain, SERVER_INVITE),
            Policy::new(SERVER_MEMBER, domain, domain, REPO_CREATE),
        ])?;
        self.backend.add_grouping(SERVER_OWNER, SERVER_MEMBER, domain)?;
        info!("policy domain ready");
        Ok(())
    }

    pub fn add_owner(&self, domain: &str, owner: &str) -> Result<(), StoreError> {
        self.backend.add_grouping(owner, SERVER_OWNER, domain)?;
        Ok(())
    }

    pub fn add_member(&self, domain: &str, member: &str) -> Result<(), StoreError> {
        self.backend.add_grouping(member, SERVER_MEMBER, domain)?;
        Ok(())
    }

    /// Give `member` full control over `repo` (`did:.../name`).  Server owners
    /// may additionally delete it.
    #[instrument(skip(self))]
    pub fn add_repo(&self, member: &str, domain: &str, repo: &str) -> Result<(), StoreError> {
        check_repo_name(repo)?;
        self.backend.add_policies(&[
            Policy::new(member, domain, repo, REPO_SETTINGS),
            Policy::new(member, domain, repo, REPO_PUSH),
            Policy::new(member, domain, repo, REPO_OWNER),
            Policy::new(member, domain, repo, REPO_INVITE),
            Policy::new(member, domain, repo, REPO_DELETE),
            Policy::new(SERVER_OWNER, domain, repo, REPO_DELETE),
        ])?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn add_collaborator(
        &self,
        collaborator: &str,
        domain: &str,
        repo: &str,
    ) -> Result<(), StoreError> {
        check_repo_name(repo)?;
        self.backend.add_policies(&[
            Policy::new(collaborator, domain, repo, REPO_SETTINGS),
            Policy::new(collaborator, domain, repo, REPO_PUSH),
        ])?;
        Ok(())
    }

    /// Drop every grant whose object is `repo`.
    #[instrument(skip(self))]
    pub fn remove_repo(&self, domain: &str, repo: &str) -> Result<usize, StoreError> {
        self.backend.remove_object(domain, repo)
    }

    pub fn revoke(
        &self,
        subject: &str,
        domain: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, StoreError> {
        self.backend
            .remove_policy(&Policy::new(subject, domain, object, action))
    }

    pub fn remove_member(&self, domain: &str, member: &str) -> Result<bool, StoreError> {
        self.backend.remove_grouping(member, SERVER_MEMBER, domain)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Identities (not intermediate roles) holding `role` in `domain`.
    pub fn users_for_role(&self, role: &str, domain: &str) -> Result<Vec<String>, StoreError> {
        let users = self.backend.users_for_role(role, domain)?;
        Ok(users.into_iter().filter(|u| u.starts_with("did:")).collect())
    }

    pub fn roles_for_user(&self, subject: &str, domain: &str) -> Result<Vec<String>, StoreError> {
        self.backend.roles_for_user(subject, domain)
    }

    pub fn domains_for_user(&self, subject: &str) -> Result<Vec<String>, StoreError> {
        self.backend.domains_for_user(subject)
    }

    pub fn is_server_owner(&self, subject: &str, domain: &str) -> Result<bool, StoreError> {
        self.backend.has_grouping(subject, SERVER_OWNER, domain)
    }

    /// Whether anyone has claimed the knot `domain`.
    pub fn has_owner(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(!self.users_for_role(SERVER_OWNER, domain)?.is_empty())
    }

    pub fn is_server_member(&self, subject: &str, domain: &str) -> Result<bool, StoreError> {
        self.backend.has_grouping(subject, SERVER_MEMBER, domain)
    }

    /// May `subject` invite members to the knot `domain`.
    pub fn is_invite_allowed(&self, subject: &str, domain: &str) -> Result<bool, StoreError> {
        self.enforce(subject, domain, domain, SERVER_INVITE)
    }

    pub fn is_repo_create_allowed(&self, subject: &str, domain: &str) -> Result<bool, StoreError> {
        self.enforce(subject, domain, domain, REPO_CREATE)
    }

    pub fn is_push_allowed(
        &self,
        subject: &str,
        domain: &str,
        repo: &str,
    ) -> Result<bool, StoreError> {
        self.enforce(subject, domain, repo, REPO_PUSH)
    }

    pub fn is_settings_allowed(
        &self,
        subject: &str,
        domain: &str,
        repo: &str,
    ) -> Result<bool, StoreError> {
        self.enforce(subject, domain, repo, REPO_SETTINGS)
    }

    pub fn is_collaborator_invite_allowed(
        &self,
        subject: &str,
        domain: &str,
        repo: &str,
    ) -> Result<bool, StoreError> {
        self.enforce(subject, domain, repo, REPO_INVITE)
    }

    pub fn is_repo_delete_allowed(
        &self,
        subject: &str,
        domain: &str,
        repo: &str,
    ) -> Result<bool, StoreError> {
        self.enforce(subject, domain, repo, REPO_DELETE)
    }
}

/// Repository objects are `did:<...>/<name>` with a single slash.
pub fn check_repo_name(repo: &str) -> Result<(), StoreError> {
    match repo.split_once('/') {
        Some((owner, name))
            if owner.starts_with("did:") && !name.is_empty() && !name.contains('/') =>
        {
            Ok(())
        }
        _ => Err(StoreError::InvalidRepo(repo.to_string())),
    }
}
