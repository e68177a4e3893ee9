//! Responder side of an RPC queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::RemoteError;
use crate::descriptor::Descriptor;
use crate::dispatch::Dispatcher;
use crate::driver::ReplyRouter;
use crate::entity::InboundSink;
use crate::error::{BusError, RpcError};
use crate::headers::Headers;
use crate::serializer::{encode, Serializer};
use crate::transport::{header, Delivery};

/// Serves one RPC queue. Picks the consumer by message namespace and sends
/// the outcome to the request's reply-to address.
pub struct RpcResponder {
    dispatcher: Dispatcher,
    replies: ReplyRouter,
    routes: BTreeMap<&'static str, Arc<Descriptor>>,
}

impl RpcResponder {
    pub fn new(dispatcher: Dispatcher, replies: ReplyRouter) -> Self {
        Self {
            dispatcher,
            replies,
            routes: BTreeMap::new(),
        }
    }

    /// Serve `descriptor` under its namespace.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateConsumer`] when the namespace is already served.
    pub fn route(&mut self, descriptor: Arc<Descriptor>) -> Result<(), BusError> {
        let namespace = descriptor
            .namespace()
            .unwrap_or_else(|| descriptor.message_type().name());
        if let Some(existing) = self.routes.get(namespace) {
            return Err(BusError::DuplicateConsumer {
                message_type: descriptor.message_type().name(),
                consumers: vec![existing.consumer_name(), descriptor.consumer_name()],
            });
        }
        self.routes.insert(namespace, descriptor);
        Ok(())
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    /// The descriptor for `namespace`. A request without one goes to the only
    /// route, if there is exactly one.
    fn select(&self, namespace: Option<&str>) -> Result<&Arc<Descriptor>, RpcError> {
        match namespace {
            Some(ns) => self.routes.get(ns).ok_or_else(|| RpcError::UnknownNamespace {
                namespace: ns.to_owned(),
            }),
            None if self.routes.len() == 1 => self
                .routes
                .values()
                .next()
                .ok_or(RpcError::MissingMetadata { field: header::NAMESPACE }),
            None => Err(RpcError::MissingMetadata {
                field: header::NAMESPACE,
            }),
        }
    }

    async fn handle(
        &self,
        serializer: &dyn Serializer,
        headers: &Headers,
        body: &[u8],
    ) -> Result<bytes::Bytes, BusError> {
        let descriptor = self.select(headers.namespace())?;
        let codec = descriptor.codec().ok_or(BusError::NotWired {
            message_type: descriptor.message_type().name(),
        })?;
        let message = codec.decode_message(serializer, body)?;
        let output = self
            .dispatcher
            .invoke_in_new_scope(descriptor, message, headers.clone())
            .await?;
        match output {
            Some(result) => codec.encode_result(serializer, result.as_ref()),
            None => Ok(encode(serializer, &())?),
        }
    }
}

#[async_trait]
impl InboundSink for RpcResponder {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BusError> {
        let Delivery { mut headers, body } = delivery;
        headers.set_received_at(Utc::now());

        let content_type = headers
            .content_type()
            .map(str::to_owned)
            .ok_or(RpcError::MissingMetadata { field: header::CONTENT_TYPE })?;
        let message_id = headers
            .message_id()
            .cloned()
            .ok_or(RpcError::MissingMetadata { field: header::MESSAGE_ID })?;
        let correlation_id = headers
            .correlation_id()
            .cloned()
            .ok_or(RpcError::MissingMetadata { field: header::CORRELATION_ID })?;
        let reply_to = headers
            .reply_to()
            .cloned()
            .ok_or(RpcError::MissingMetadata { field: header::REPLY_TO })?;

        let serializer = self
            .dispatcher
            .serializers()
            .negotiate(Some(content_type.as_str()))?;

        let mut reply = Headers::correlated(correlation_id.clone());
        reply.set_message_id(message_id);
        reply.set_content_type(content_type);

        let body = match self.handle(serializer.as_ref(), &headers, &body).await {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    correlation_id = %correlation_id,
                    namespace = headers.namespace().unwrap_or(""),
                    error = %error,
                    "rpc request failed, replying with error"
                );
                reply.mark_error();
                let remote = RemoteError {
                    kind: error.kind().to_owned(),
                    message: error.to_string(),
                };
                encode(serializer.as_ref(), &remote)?
            }
        };

        self.replies.send(&reply_to, Delivery::new(reply, body)).await?;
        debug!(correlation_id = %correlation_id, reply_to = %reply_to, "rpc reply sent");
        Ok(())
    }
}
