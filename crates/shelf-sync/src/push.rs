// File: shelf-sync/src/push.rs
// Purpose: Push channel client with reconnection

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

use crate::compression::binary_frame_text;
use crate::config::ReconnectPolicy;
use crate::realtime::PushEvent;

/// A data frame received on the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    Text(String),
    /// Gzip-compressed JSON
    Binary(Vec<u8>),
}

impl PushFrame {
    /// Decode the frame, logging and skipping anything unusable
    pub fn into_event(self) -> Option<PushEvent> {
        let text = match self {
            PushFrame::Text(text) => text,
            PushFrame::Binary(data) => match binary_frame_text(&data) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to decode binary push frame: {:#}", e);
                    return None;
                }
            },
        };

        match PushEvent::decode(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("Failed to parse push message: {}", e);
                None
            }
        }
    }
}

pub type PushStream = BoxStream<'static, anyhow::Result<PushFrame>>;

/// Opens push channel connections
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Open a connection; the stream ends when the connection closes
    async fn connect(&self) -> anyhow::Result<PushStream>;
}

/// [`PushConnector`] over a websocket
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self) -> anyhow::Result<PushStream> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.url))?;

        let frames = socket.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(PushFrame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(PushFrame::Binary(data))),
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::new(e).context("Push channel error"))),
            })
        });

        Ok(frames.boxed())
    }
}

/// Keeps a push channel open and hands every event to a callback
pub struct PushListener {
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
}

impl PushListener {
    pub fn new(connector: Arc<dyn PushConnector>, policy: ReconnectPolicy) -> Self {
        Self { connector, policy }
    }

    /// Listen until reconnection attempts are exhausted
    ///
    /// After a connection closes (or fails to open) the listener waits
    /// `base * 2^attempt` and tries again. A successful open resets the count.
    pub async fn run<F, Fut>(&self, mut on_event: F)
    where
        F: FnMut(PushEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut attempt: u32 = 0;

        loop {
            match self.connector.connect().await {
                Ok(mut frames) => {
                    tracing::info!("Push channel connected");
                    attempt = 0;

                    while let Some(frame) = frames.next().await {
                        match frame {
                            Ok(frame) => {
                                if let Some(event) = frame.into_event() {
                                    on_event(event).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("{:#}", e);
                                break;
                            }
                        }
                    }
                    tracing::info!("Push channel disconnected");
                }
                Err(e) => tracing::warn!("{:#}", e),
            }

            if attempt >= self.policy.max_attempts {
                tracing::error!("Push channel reconnect attempts exhausted");
                return;
            }

            let delay = self.policy.delay_for(attempt);
            attempt += 1;
            tracing::info!("Reconnecting push channel in {:?} (attempt {})", delay, attempt);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::compress;
    use crate::identifier::RecordId;

    #[test]
    fn test_text_frame() {
        let frame = PushFrame::Text(r#"{"type":"delete_book","data":{"id":"3"}}"#.to_string());
        assert_eq!(frame.into_event(), Some(PushEvent::DeleteBook { id: RecordId::server("3") }));
    }

    #[test]
    fn test_binary_frame() {
        let json = r#"{"type":"delete_book","data":{"id":"3"}}"#;
        let frame = PushFrame::Binary(compress(json.as_bytes(), 6).unwrap());
        assert_eq!(frame.into_event(), Some(PushEvent::DeleteBook { id: RecordId::server("3") }));
    }

    #[test]
    fn test_garbage_frames_are_skipped() {
        assert_eq!(PushFrame::Text("{".to_string()).into_event(), None);
        assert_eq!(PushFrame::Binary(vec![1, 2, 3]).into_event(), None);
    }
}
