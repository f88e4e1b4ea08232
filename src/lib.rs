//! Access-control core of a knot: a self-hosted git server in a federated
//! code-collaboration network.
//!
//! The crate ships three executables:
//! - `knotserver`, the internal signed HTTP API plus the event-stream consumer
//! - `repoguard`, the forced SSH command that gates git transport
//! - `keyfetch`, the sshd `AuthorizedKeysCommand` helper

pub mod auth;
pub mod config;
pub mod db;
pub mod firehose;
pub mod git;
pub mod guard;
pub mod health;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod rbac;

use std::sync::Arc;

use crate::auth::{SharedSecret, Verifier};
use crate::config::Config;
use crate::db::Db;
use crate::firehose::SyncHandle;
use crate::identity::DirectoryClient;
use crate::metrics::MetricsRegistry;
use crate::rbac::Enforcer;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub enforcer: Enforcer,
    pub verifier: Arc<Verifier>,
    pub secret: SharedSecret,
    pub metrics: MetricsRegistry,
    /// Event filter and init gate shared with the consumer task.
    pub sync: SyncHandle,
    pub directory: DirectoryClient,
}

impl AppState {
    /// The policy domain of this knot, which is its hostname.
    pub fn domain(&self) -> &str {
        &self.config.server.hostname
    }
}
