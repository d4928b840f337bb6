//! Upstream event bridge: hub connection management, payload normalization, audience
//! resolution and fan-out to downstream delivery channels.

pub mod audience;
pub mod hub;
pub mod payload;
pub mod router;
pub mod transport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::models::{AudienceKey, NormalizedEvent};
use thiserror::Error;

pub use hub::{ConnectionState, HubHandle, HubSupervisor};
pub use router::FanoutRouter;
pub use transport::{UpstreamLink, UpstreamTransport, WebSocketTransport};

/// A hub method call travelling in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub target: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Invocation {
    pub fn new(target: impl Into<String>, arguments: Value) -> Self {
        Self {
            target: target.into(),
            arguments,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is not connected")]
    NotConnected,
    #[error("hub outbound queue is full")]
    Backpressure,
    #[error("hub transport error: {0}")]
    Transport(String),
    #[error("hub connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to encode event for {audience}: {source}")]
    Encode {
        audience: AudienceKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("delivery channel for {0} is unavailable")]
    Unavailable(AudienceKey),
}

/// Downstream per-audience delivery channel.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, audience: AudienceKey, event: NormalizedEvent)
    -> Result<(), DeliveryError>;
}
