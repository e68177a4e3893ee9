//! What crosses a broker boundary: header names, deliveries, and the outbound
//! seams the RPC engine talks to.

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::MessageType;
use crate::error::BusError;
use crate::headers::Headers;

/// Transport header names.
pub mod header {
    pub const CONTENT_TYPE: &str = "content-type";
    pub const MESSAGE_ID: &str = "message-id";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const REPLY_TO: &str = "reply-to";
    pub const ROUTE_KEY: &str = "route-key";
    pub const NAMESPACE: &str = "message-namespace";
    pub const SOURCE: &str = "source-service";
    pub const OCCURRED_AT: &str = "occurred-at";
    /// Reserved flag set on RPC replies that carry a remote error.
    pub const ERROR: &str = "x-error";
    /// Prefix for extension headers, `x-ext-<name>`.
    pub const EXTENSION_PREFIX: &str = "x-ext-";
}

/// An encoded message as a broker hands it over or takes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub headers: Headers,
    pub body: Bytes,
}

impl Delivery {
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }
}

/// Publishes typed messages onto a bus.
///
/// Implemented by the bus driver; the RPC client publishes requests through it.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Enrich, encode and fan out. Returns how many entities accepted.
    async fn send_message(
        &self,
        message_type: &MessageType,
        headers: Headers,
        message: &(dyn erased_serde::Serialize + Sync),
    ) -> Result<usize, BusError>;
}

/// Sends an already-encoded reply to a queue on one bus.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(&self, queue: &str, delivery: Delivery) -> Result<(), BusError>;
}

/// Transport-specific direct send to a named queue, used for replies.
#[async_trait]
pub trait QueueSender<T>: Send + Sync {
    async fn send(&self, transport: &T, queue: &str, delivery: Delivery) -> anyhow::Result<()>;
}
