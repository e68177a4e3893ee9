//! Caller side: one reply queue, many concurrent calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::pending::PendingRequests;
use super::RemoteError;
use crate::address::ReplyAddress;
use crate::connection::RpcSettings;
use crate::core::{Command, MessageType, Query};
use crate::enrich::causal_correlation_id;
use crate::entity::{BusEntity, EntityInfo, EntityKind, EntityOptions, InboundSink, StrategyFactory};
use crate::error::{BusError, RpcError};
use crate::headers::{CorrelationId, Headers};
use crate::serializer::{decode, Serializer, SerializerRegistry};
use crate::transport::{Delivery, Outbound};

/// Extension header carrying the caller's own correlation id, since the
/// request itself gets a fresh one.
pub const CAUSATION_ID: &str = "causation-id";

/// A caller's private reply queue and its pending-request map.
pub struct ReplyQueue {
    bus: String,
    name: String,
    pending: Arc<PendingRequests>,
}

impl ReplyQueue {
    /// Reply queue `<base>-<token>` on `bus`, unique to this process.
    pub fn new(bus: impl Into<String>, base: &str) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self {
            bus: bus.into(),
            name: format!("{base}-{}", &token[..12]),
            pending: Arc::new(PendingRequests::new()),
        }
    }

    pub fn bus(&self) -> &str {
        &self.bus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where responders send replies.
    pub fn address(&self) -> ReplyAddress {
        ReplyAddress::new(self.bus.clone(), self.name.clone())
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// The bus entity that consumes this queue.
    pub fn entity<T>(self: &Arc<Self>, factory: &dyn StrategyFactory<T>) -> BusEntity<T> {
        let info = EntityInfo::new(self.bus.clone(), self.name.clone(), EntityKind::ReplyQueue)
            .with_options(EntityOptions::auto_delete());
        BusEntity::from_factory(info, factory).with_sink(self.clone())
    }

    /// Cancel every outstanding call.
    pub fn shutdown(&self) -> usize {
        self.pending.cancel_all()
    }
}

#[async_trait]
impl InboundSink for ReplyQueue {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BusError> {
        let Some(id) = delivery.headers.correlation_id().cloned() else {
            warn!(queue = %self.name, "reply without correlation id discarded");
            return Ok(());
        };
        if !self.pending.complete(&id, delivery) {
            debug!(queue = %self.name, correlation_id = %id, "late or duplicate reply discarded");
        }
        let swept = self.pending.purge_expired();
        if swept > 0 {
            debug!(queue = %self.name, swept, "expired rpc entries swept");
        }
        Ok(())
    }
}

/// Issues commands and queries to remote responders and awaits their replies.
pub struct RpcClient {
    outbound: Arc<dyn Outbound>,
    replies: Arc<ReplyQueue>,
    serializers: SerializerRegistry,
    settings: RpcSettings,
}

impl RpcClient {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        replies: Arc<ReplyQueue>,
        serializers: SerializerRegistry,
        settings: RpcSettings,
    ) -> Self {
        Self {
            outbound,
            replies,
            serializers,
            settings,
        }
    }

    pub fn replies(&self) -> &Arc<ReplyQueue> {
        &self.replies
    }

    pub async fn call<C>(&self, command: &C) -> Result<C::Result, BusError>
    where
        C: Command + Serialize,
        C::Result: DeserializeOwned,
    {
        self.call_with(Headers::new(), command).await
    }

    pub async fn call_with<C>(&self, headers: Headers, command: &C) -> Result<C::Result, BusError>
    where
        C: Command + Serialize,
        C::Result: DeserializeOwned,
    {
        self.request(MessageType::command::<C>(), C::namespace(), headers, command)
            .await
    }

    pub async fn ask<Q>(&self, query: &Q) -> Result<Q::Result, BusError>
    where
        Q: Query + Serialize,
        Q::Result: DeserializeOwned,
    {
        self.ask_with(Headers::new(), query).await
    }

    pub async fn ask_with<Q>(&self, headers: Headers, query: &Q) -> Result<Q::Result, BusError>
    where
        Q: Query + Serialize,
        Q::Result: DeserializeOwned,
    {
        self.request(MessageType::query::<Q>(), Q::namespace(), headers, query)
            .await
    }

    async fn request<R: DeserializeOwned>(
        &self,
        message_type: MessageType,
        namespace: &'static str,
        mut headers: Headers,
        message: &(dyn erased_serde::Serialize + Sync),
    ) -> Result<R, BusError> {
        if let Some(cause) = headers.correlation_id().cloned().or_else(causal_correlation_id) {
            headers.set_extension(CAUSATION_ID, cause.as_str());
        }
        let id = CorrelationId::new();
        headers.force_correlation_id(id.clone());
        headers.force_reply_to(self.replies.address());
        headers.force_namespace(namespace);
        if headers.content_type().is_none() {
            headers.set_content_type(self.serializers.default_serializer().content_type());
        }

        // Registered before publishing so a fast reply always finds its entry.
        let guard = self
            .replies
            .pending()
            .register(id.clone(), self.settings.timeout)?;

        // The publish spends from the same deadline as the wait.
        tokio::time::timeout_at(guard.deadline(), self.outbound.send_message(&message_type, headers, message))
            .await
            .map_err(|_| guard.timed_out())?
            .map_err(|e| RpcError::Publish(Box::new(e)))?;
        debug!(correlation_id = %id, namespace, "rpc request sent");

        let reply = guard.wait().await?;
        let serializer = self.serializers.negotiate(reply.headers.content_type())?;

        if reply.headers.is_error() {
            let remote = decode::<RemoteError>(serializer.as_ref(), &reply.body).unwrap_or_else(|_| RemoteError {
                kind: "unknown".to_owned(),
                message: String::from_utf8_lossy(&reply.body).into_owned(),
            });
            return Err(RpcError::Remote {
                kind: remote.kind,
                message: remote.message,
            }
            .into());
        }

        Ok(decode::<R>(serializer.as_ref(), &reply.body)?)
    }
}
