//! Which identities and collections the stream subscription asks for, plus
//! the signals that tell the consumer to resubscribe or start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::SyncError;

/// Query of one stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub collections: Vec<String>,
    pub dids: Vec<String>,
    pub cursor: Option<i64>,
}

impl Subscription {
    /// `base` with `wantedCollections`, `wantedDids` and `cursor` appended.
    pub fn url(&self, base: &str) -> Result<Url, SyncError> {
        let mut url = Url::parse(base)
            .map_err(|e| SyncError::Connection(format!("invalid stream URL {base}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for collection in &self.collections {
                query.append_pair("wantedCollections", collection);
            }
            for did in &self.dids {
                query.append_pair("wantedDids", did);
            }
            if let Some(cursor) = self.cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        Ok(url)
    }
}

struct Inner {
    collections: Vec<String>,
    dids: RwLock<Vec<String>>,
    reconnect: mpsc::Sender<()>,
    init_claimed: AtomicBool,
    initialized: watch::Sender<bool>,
}

/// Shared view of the stream filter, held by the API handlers and the
/// consumer.
///
/// Growing the DID list posts to a single-slot channel; further signals
/// while one is pending are dropped, so a burst of additions costs one
/// reconnect.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<Inner>,
}

impl SyncHandle {
    /// Returns the handle and the receiving end of the reconnect signal.
    pub fn new(collections: Vec<String>) -> (Self, mpsc::Receiver<()>) {
        let (reconnect, reconnect_rx) = mpsc::channel(1);
        let (initialized, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(Inner {
                collections,
                dids: RwLock::new(Vec::new()),
                reconnect,
                init_claimed: AtomicBool::new(false),
                initialized,
            }),
        };
        (handle, reconnect_rx)
    }

    fn insert_dids<I, S>(&self, dids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut current = self
            .inner
            .dids
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for did in dids {
            let did = did.into();
            if !did.is_empty() && !current.contains(&did) {
                current.push(did);
                added += 1;
            }
        }
        added
    }

    /// Add identities without requesting a reconnect.  Used at startup.
    pub fn seed_dids<I, S>(&self, dids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert_dids(dids)
    }

    /// Add identities and, if any were new, ask the consumer to reconnect
    /// with the wider filter.
    pub fn add_dids<I, S>(&self, dids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = self.insert_dids(dids);
        if added > 0 {
            self.request_reconnect();
        }
        added
    }

    /// Returns `false` when a reconnect was already pending.
    pub fn request_reconnect(&self) -> bool {
        match self.inner.reconnect.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("reconnect already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    pub fn dids(&self) -> Vec<String> {
        self.inner
            .dids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscription(&self, cursor: i64) -> Subscription {
        Subscription {
            collections: self.inner.collections.clone(),
            dids: self.dids(),
            cursor: Some(cursor),
        }
    }

    // -----------------------------------------------------------------------
    // Initialization gate
    // -----------------------------------------------------------------------

    /// Reserve the right to initialize.  Only the first caller wins until
    /// [`release_init`](Self::release_init).
    pub fn claim_init(&self) -> bool {
        !self.is_initialized()
            && self
                .inner
                .init_claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Give up a claim after a failed initialization.
    pub fn release_init(&self) {
        self.inner.init_claimed.store(false, Ordering::Release);
    }

    pub fn mark_initialized(&self) {
        self.inner.init_claimed.store(true, Ordering::Release);
        self.inner.initialized.send_replace(true);
    }

    pub fn is_initialized(&self) -> bool {
        *self.inner.initialized.borrow()
    }

    /// Resolves once the node has an owner.
    pub async fn wait_initialized(&self) {
        let mut rx = self.inner.initialized.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|initialized| *initialized).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn url_carries_filter_and_cursor() {
        let sub = Subscription {
            collections: vec!["sh.tangled.publicKey".into(), "sh.tangled.knot.member".into()],
            dids: vec!["did:plc:a".into()],
            cursor: Some(42),
        };
        let url = sub.url("wss://stream.example.com/subscribe").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://stream.example.com/subscribe?wantedCollections=sh.tangled.publicKey\
             &wantedCollections=sh.tangled.knot.member&wantedDids=did%3Aplc%3Aa&cursor=42"
        );
    }

    #[test]
    fn additions_coalesce_into_one_reconnect() {
        let (handle, mut rx) = SyncHandle::new(vec![]);
        assert_eq!(handle.add_dids(["did:plc:a"]), 1);
        assert_eq!(handle.add_dids(["did:plc:b", "did:plc:a", ""]), 1);
        assert_eq!(handle.dids(), vec!["did:plc:a", "did:plc:b"]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn known_dids_do_not_signal() {
        let (handle, mut rx) = SyncHandle::new(vec![]);
        handle.seed_dids(["did:plc:a"]);
        assert_eq!(handle.add_dids(["did:plc:a"]), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn init_can_only_be_claimed_once() {
        let (handle, _rx) = SyncHandle::new(vec![]);
        assert!(handle.claim_init());
        assert!(!handle.claim_init());
        handle.release_init();
        assert!(handle.claim_init());
        handle.mark_initialized();
        handle.release_init();
        assert!(!handle.claim_init());
    }

    #[tokio::test]
    async fn wait_initialized_resolves_after_mark() {
        let (handle, _rx) = SyncHandle::new(vec![]);
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_initialized().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        handle.mark_initialized();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
