//! Broker deliveries into the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::descriptor::Descriptor;
use crate::dispatch::Dispatcher;
use crate::entity::InboundSink;
use crate::error::BusError;
use crate::transport::Delivery;

/// Feeds one entity's deliveries to one descriptor.
///
/// Each delivery runs in a fresh scope. The descriptor's predicate still
/// applies; a delivery it rejects is acknowledged and dropped.
pub struct DescriptorReceiver {
    dispatcher: Dispatcher,
    descriptor: Arc<Descriptor>,
}

impl DescriptorReceiver {
    pub fn new(dispatcher: Dispatcher, descriptor: Arc<Descriptor>) -> Self {
        Self {
            dispatcher,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }
}

#[async_trait]
impl InboundSink for DescriptorReceiver {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BusError> {
        let Delivery { mut headers, body } = delivery;
        headers.set_received_at(Utc::now());

        let descriptor = &self.descriptor;
        let codec = descriptor.codec().ok_or(BusError::NotWired {
            message_type: descriptor.message_type.name(),
        })?;
        let serializer = self
            .dispatcher
            .serializers()
            .negotiate(headers.content_type())?;
        let message = codec.decode_message(serializer.as_ref(), &body)?;

        if !descriptor.matches(message.as_ref(), &headers) {
            debug!(
                consumer = descriptor.consumer,
                message_type = descriptor.message_type.name(),
                "delivery rejected by predicate"
            );
            return Ok(());
        }

        self.dispatcher
            .invoke_in_new_scope(descriptor, message, headers)
            .await
            .map(|_| ())
    }
}
