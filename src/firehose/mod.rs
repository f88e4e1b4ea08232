//! Consumer of the federated event stream.
//!
//! The stream is filtered to the collections this node cares about and to
//! the identities it tracks.  Each event is applied to the policy and key
//! stores, after which the persisted cursor moves past it so a restart
//! resumes where processing stopped.
//!
//! - [`event`]: wire types.
//! - [`filter`]: the shared, growable subscription filter and init gate.
//! - [`source`]: where raw messages come from.
//! - [`ingest`]: per-event application.
//! - [`consumer`]: the long-running connection loop.

pub mod consumer;
pub mod event;
pub mod filter;
pub mod ingest;
pub mod source;

pub use consumer::{EventSync, SyncSettings};
pub use filter::{Subscription, SyncHandle};
pub use ingest::{EventOutcome, Ingester};
pub use source::{EventSource, WebsocketSource};

use thiserror::Error;

use crate::db::StoreError;

/// Collection carrying users' SSH public keys.
pub const PUBLIC_KEY_NSID: &str = "sh.tangled.publicKey";
/// Collection carrying knot membership grants.
pub const KNOT_MEMBER_NSID: &str = "sh.tangled.knot.member";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("undecodable event: {0}")]
    Decode(String),
    #[error("invalid record: {0}")]
    Record(String),
    #[error("member record targets foreign domain {0:?}")]
    ForeignDomain(String),
    #[error("{issuer} may not invite members to {domain}")]
    NotAuthorized { issuer: String, domain: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event stream connection failed: {0}")]
    Connection(String),
}
