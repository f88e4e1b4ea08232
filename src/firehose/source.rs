use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, instrument};

use super::{Subscription, SyncError};

/// Raw JSON messages of one connection, in stream order.
pub type EventStream = BoxStream<'static, Result<String, SyncError>>;

/// Something that can open a filtered connection to the event stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, subscription: &Subscription) -> Result<EventStream, SyncError>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Jetstream-style websocket endpoint.
#[derive(Debug, Clone)]
pub struct WebsocketSource {
    url: String,
}

impl WebsocketSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl EventSource for WebsocketSource {
    #[instrument(skip_all, fields(url = %self.url, cursor = ?subscription.cursor))]
    async fn subscribe(&self, subscription: &Subscription) -> Result<EventStream, SyncError> {
        let url = subscription.url(&self.url)?;
        let (ws, response) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SyncError::Connection("websocket connect timeout".to_string()))?
            .map_err(|e| SyncError::Connection(format!("websocket connect failed: {e}")))?;
        debug!(status = %response.status(), "websocket connected");

        let messages = ws.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|_| SyncError::Decode("binary frame is not UTF-8".to_string())),
                ),
                // Pings are answered by tungstenite; a close frame ends the stream.
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::Connection(e.to_string()))),
            }
        });
        Ok(messages.boxed())
    }
}
