//! Role-based access control scoped by domain.
//!
//! Policy lives in two kinds of tuples:
//!
//! - grants `(subject, domain, object, action)`, where `object` may be a glob
//!   (see [`glob`]);
//! - groupings `(subject, role, domain)`, through which a subject inherits
//!   every grant of `role` within the same domain.
//!
//! A domain is a knot hostname.  Nothing stored under one domain ever answers
//! a query for another.  The [`PolicyBackend`] trait is the seam between the
//! [`Enforcer`] and storage; [`SqlitePolicyStore`] is the production backend.

pub mod enforcer;
pub mod glob;
pub mod store;

pub use enforcer::Enforcer;
pub use store::SqlitePolicyStore;

use crate::db::StoreError;

/// Knot administrators.  Grouped into [`SERVER_MEMBER`] on every domain.
pub const SERVER_OWNER: &str = "server:owner";
pub const SERVER_MEMBER: &str = "server:member";

/// Actions that appear in grant tuples.
pub mod action {
    pub const SERVER_INVITE: &str = "server:invite";
    pub const REPO_CREATE: &str = "repo:create";
    pub const REPO_SETTINGS: &str = "repo:settings";
    pub const REPO_PUSH: &str = "repo:push";
    pub const REPO_OWNER: &str = "repo:owner";
    pub const REPO_INVITE: &str = "repo:invite";
    pub const REPO_DELETE: &str = "repo:delete";
}

/// Upper bound on how many grouping hops are followed when resolving roles.
pub const MAX_ROLE_DEPTH: usize = 10;

/// A single positive grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Policy {
    pub subject: String,
    pub domain: String,
    pub object: String,
    pub action: String,
}

impl Policy {
    pub fn new(subject: &str, domain: &str, object: &str, action: &str) -> Self {
        Self {
            subject: subject.to_string(),
            domain: domain.to_string(),
            object: object.to_string(),
            action: action.to_string(),
        }
    }
}

/// Storage and resolution of policy tuples.
///
/// Implementations must treat the domain as part of every key and resolve
/// groupings transitively, stopping after [`MAX_ROLE_DEPTH`] hops or on a
/// cycle.
pub trait PolicyBackend: Send + Sync {
    /// `true` iff `subject`, or a role it is transitively grouped into, holds
    /// a grant for `action` in `domain` whose object pattern matches `object`.
    fn enforce(
        &self,
        subject: &str,
        domain: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, StoreError>;

    /// Insert all grants atomically.  Returns how many were new.
    fn add_policies(&self, policies: &[Policy]) -> Result<usize, StoreError>;

    fn remove_policy(&self, policy: &Policy) -> Result<bool, StoreError>;

    /// Delete every grant on `object` within `domain`.
    fn remove_object(&self, domain: &str, object: &str) -> Result<usize, StoreError>;

    fn add_grouping(&self, subject: &str, role: &str, domain: &str) -> Result<bool, StoreError>;

    fn remove_grouping(&self, subject: &str, role: &str, domain: &str)
        -> Result<bool, StoreError>;

    /// Direct grouping only.
    fn has_grouping(&self, subject: &str, role: &str, domain: &str) -> Result<bool, StoreError>;

    /// Every subject transitively grouped into `role` within `domain`.
    fn users_for_role(&self, role: &str, domain: &str) -> Result<Vec<String>, StoreError>;

    /// Every role `subject` is transitively grouped into within `domain`.
    fn roles_for_user(&self, subject: &str, domain: &str) -> Result<Vec<String>, StoreError>;

    /// Domains in which `subject` has at least one grouping.
    fn domains_for_user(&self, subject: &str) -> Result<Vec<String>, StoreError>;
}
