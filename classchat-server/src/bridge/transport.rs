use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{HubError, Invocation};

/// Frame terminator used by hub protocols that batch several JSON records per frame.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Opens connections to the upstream hub.
#[async_trait]
pub trait UpstreamTransport: Send + Sync + 'static {
    type Link: UpstreamLink;

    async fn connect(&self) -> Result<Self::Link, HubError>;
}

/// One live upstream connection.
#[async_trait]
pub trait UpstreamLink: Send + 'static {
    async fn send(&mut self, invocation: Invocation) -> Result<(), HubError>;

    /// Next inbound invocation; `None` once the peer closed the connection.
    async fn next(&mut self) -> Option<Result<Invocation, HubError>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl UpstreamTransport for WebSocketTransport {
    type Link = WebSocketLink;

    async fn connect(&self) -> Result<Self::Link, HubError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| HubError::Transport(err.to_string()))?;
        debug!(status = %response.status(), url = %self.url, "hub websocket established");
        Ok(WebSocketLink {
            stream,
            pending: VecDeque::new(),
        })
    }
}

pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Invocation>,
}

impl std::fmt::Debug for WebSocketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketLink")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Serializes one invocation as a record terminated by the record separator.
pub(crate) fn encode_frame(invocation: &Invocation) -> Result<String, HubError> {
    let mut text =
        serde_json::to_string(invocation).map_err(|err| HubError::Transport(err.to_string()))?;
    text.push(RECORD_SEPARATOR);
    Ok(text)
}

/// Splits a text frame into invocations, skipping records that are not method calls.
pub(crate) fn decode_frame(text: &str) -> VecDeque<Invocation> {
    text.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .filter_map(|record| match serde_json::from_str::<serde_json::Value>(record) {
            Ok(value) if value.get("target").is_some_and(serde_json::Value::is_string) => {
                match serde_json::from_value::<Invocation>(value) {
                    Ok(invocation) => Some(invocation),
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable hub invocation");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "dropping non-json hub record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl UpstreamLink for WebSocketLink {
    async fn send(&mut self, invocation: Invocation) -> Result<(), HubError> {
        let text = encode_frame(&invocation)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| HubError::Transport(err.to_string()))
    }

    async fn next(&mut self) -> Option<Result<Invocation, HubError>> {
        loop {
            if let Some(invocation) = self.pending.pop_front() {
                return Some(Ok(invocation));
            }

            match self.stream.next().await? {
                Ok(Message::Text(text)) => self.pending = decode_frame(&text),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.pending = decode_frame(text),
                    Err(_) => warn!("dropping non-utf8 binary hub frame"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(HubError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "hub websocket close failed");
        }
    }
}
