use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{EventSource, Ingester, SyncError, SyncHandle};
use crate::config::FirehoseConfig;
use crate::db::Db;
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Older persisted cursors are replaced by "now" on the first connect.
    pub max_cursor_age: Duration,
    /// Pause between a failed or closed connection and the next attempt.
    pub reconnect_delay: Duration,
}

impl From<&FirehoseConfig> for SyncSettings {
    fn from(config: &FirehoseConfig) -> Self {
        Self {
            max_cursor_age: config.max_cursor_age(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    Shutdown,
    /// The filter grew; reconnect immediately.
    Reconnect,
    /// The server closed the stream.
    Closed,
}

/// Long-running consumer of the event stream.
pub struct EventSync<S> {
    source: S,
    ingester: Ingester,
    handle: SyncHandle,
    reconnect_rx: mpsc::Receiver<()>,
    db: Db,
    settings: SyncSettings,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
    /// Set once the first subscription went out.
    started: bool,
}

impl<S: EventSource> EventSync<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        ingester: Ingester,
        handle: SyncHandle,
        reconnect_rx: mpsc::Receiver<()>,
        db: Db,
        settings: SyncSettings,
        metrics: MetricsRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            ingester,
            handle,
            reconnect_rx,
            db,
            settings,
            metrics,
            shutdown,
            started: false,
        }
    }

    /// Wait for the knot to be initialized, then consume until shutdown,
    /// reconnecting as needed.
    pub async fn run(mut self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = self.handle.wait_initialized() => {}
        }
        info!("knot initialized; starting event sync");

        loop {
            match self.run_connection().await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Reconnect) => {
                    self.metrics.metrics.firehose_reconnects.inc();
                    continue;
                }
                Ok(ConnectionEnd::Closed) => warn!("event stream closed by server"),
                Err(e) => warn!(error = %e, "event stream failed"),
            }

            self.metrics.metrics.firehose_reconnects.inc();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
        info!("event sync stopped");
    }

    /// One connection: subscribe from the persisted cursor and process
    /// messages in order until shutdown, a filter change, or a stream error.
    pub async fn run_connection(&mut self) -> Result<ConnectionEnd, SyncError> {
        // The new subscription already reflects any pending filter change.
        while self.reconnect_rx.try_recv().is_ok() {}

        // Only a startup cursor can be stale; later reconnects resume where
        // this process left off.
        let max_age = (!self.started).then_some(self.settings.max_cursor_age);
        let cursor = resume_point(&self.db, now_us(), max_age);
        self.started = true;
        let subscription = self.handle.subscription(cursor);
        info!(cursor, dids = subscription.dids.len(), "subscribing to event stream");
        let mut stream = self.source.subscribe(&subscription).await?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(ConnectionEnd::Shutdown),
                Some(()) = self.reconnect_rx.recv() => {
                    info!("subscription filter changed; reconnecting");
                    return Ok(ConnectionEnd::Reconnect);
                }
                message = stream.next() => match message {
                    Some(Ok(raw)) => {
                        self.ingester.process(&raw).await;
                    }
                    Some(Err(SyncError::Decode(e))) => {
                        warn!(error = %e, "dropping unreadable frame");
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(ConnectionEnd::Closed),
                }
            }
        }
    }
}

fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

/// Cursor to subscribe from.  A missing cursor, or one older than
/// `max_age` when given, is replaced by `now_us` and persisted; the gap is
/// not replayed.
pub fn resume_point(db: &Db, now_us: i64, max_age: Option<Duration>) -> i64 {
    let max_age_us = max_age
        .map_or(i64::MAX, |age| i64::try_from(age.as_micros()).unwrap_or(i64::MAX));
    let stored = db.last_time_us().unwrap_or_else(|e| {
        warn!(error = %e, "failed to read cursor; starting from now");
        None
    });

    let cursor = match stored {
        Some(cursor) if now_us.saturating_sub(cursor) <= max_age_us => return cursor,
        Some(cursor) => {
            warn!(cursor, now_us, "stored cursor too old; starting from now");
            now_us
        }
        None => {
            info!(now_us, "no stored cursor; starting from now");
            now_us
        }
    };

    if let Err(e) = db.save_last_time_us(cursor) {
        warn!(error = %e, "failed to persist cursor");
    }
    cursor
}
