use tracing::{debug, error, info, instrument, warn};

use super::event::{self, Event, EventKind, KnotMemberRecord, Operation, PublicKeyRecord};
use super::{SyncError, SyncHandle, KNOT_MEMBER_NSID, PUBLIC_KEY_NSID};
use crate::db::{check_did, Db};
use crate::identity::DirectoryClient;
use crate::metrics::{EventLabels, MetricsRegistry};
use crate::rbac::Enforcer;

/// What became of one raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event changed (or re-confirmed) local state.
    Applied,
    /// Valid but irrelevant to this node.
    Ignored,
    /// Decoded but refused; the cursor still moves past it.
    Rejected,
    /// Not decodable at all; the cursor stays put.
    Skipped,
}

impl EventOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Ignored => "ignored",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }
}

/// Applies stream events to the local stores.
#[derive(Clone)]
pub struct Ingester {
    db: Db,
    enforcer: Enforcer,
    domain: String,
    handle: SyncHandle,
    directory: DirectoryClient,
    metrics: MetricsRegistry,
}

impl Ingester {
    pub fn new(
        db: Db,
        enforcer: Enforcer,
        domain: impl Into<String>,
        handle: SyncHandle,
        directory: DirectoryClient,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            db,
            enforcer,
            domain: domain.into(),
            handle,
            directory,
            metrics,
        }
    }

    /// Decode and apply one message, then persist the cursor past it.
    pub async fn process(&self, raw: &str) -> EventOutcome {
        let outcome = match event::decode(raw) {
            Ok(event) => {
                let outcome = match self.apply(&event) {
                    Ok(true) => EventOutcome::Applied,
                    Ok(false) => EventOutcome::Ignored,
                    Err(e) => {
                        warn!(did = %event.did, time_us = event.time_us, error = %e, "event rejected");
                        EventOutcome::Rejected
                    }
                };
                self.advance_cursor(event.time_us);
                outcome
            }
            Err(e) => {
                warn!(error = %e, "skipping undecodable event");
                EventOutcome::Skipped
            }
        };

        self.metrics
            .metrics
            .firehose_events
            .get_or_create(&EventLabels {
                outcome: outcome.label().to_string(),
            })
            .inc();
        outcome
    }

    fn advance_cursor(&self, time_us: i64) {
        match self.db.save_last_time_us(time_us.saturating_add(1)) {
            Ok(cursor) => {
                self.metrics.metrics.firehose_cursor.set(cursor);
            }
            Err(e) => error!(time_us, error = %e, "failed to persist cursor"),
        }
    }

    /// `Ok(false)` for events this node does not act on.
    pub fn apply(&self, event: &Event) -> Result<bool, SyncError> {
        let commit = match (&event.kind, &event.commit) {
            (EventKind::Commit, Some(commit)) => commit,
            _ => return Ok(false),
        };

        match (commit.collection.as_str(), commit.operation) {
            (PUBLIC_KEY_NSID, Operation::Create | Operation::Update) => {
                self.apply_public_key(&event.did, commit.record()?)
            }
            (KNOT_MEMBER_NSID, Operation::Create | Operation::Update) => {
                self.apply_member(&event.did, commit.record()?)
            }
            (collection, operation) => {
                debug!(%collection, ?operation, "ignoring commit");
                Ok(false)
            }
        }
    }

    fn apply_public_key(&self, did: &str, record: PublicKeyRecord) -> Result<bool, SyncError> {
        let added = self.db.add_public_key(
            did,
            &record.name,
            &record.key,
            record.created.as_deref(),
        )?;
        info!(%did, name = %record.name, added, "public key registered");
        Ok(true)
    }

    #[instrument(skip(self, record), fields(member = %record.member))]
    fn apply_member(&self, issuer: &str, record: KnotMemberRecord) -> Result<bool, SyncError> {
        check_did(&record.member)?;
        if record.domain != self.domain {
            return Err(SyncError::ForeignDomain(record.domain));
        }
        if !self.enforcer.is_invite_allowed(issuer, &self.domain)? {
            return Err(SyncError::NotAuthorized {
                issuer: issuer.to_string(),
                domain: self.domain.clone(),
            });
        }

        self.enforcer.add_member(&self.domain, &record.member)?;
        self.db.add_did(&record.member)?;
        self.handle.add_dids([record.member.clone()]);
        info!(%issuer, domain = %self.domain, "member added");

        self.directory
            .spawn_register_keys(self.db.clone(), record.member);
        Ok(true)
    }
}
