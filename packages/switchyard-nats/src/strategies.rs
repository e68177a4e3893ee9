//! Entity strategies backed by NATS subjects.
//!
//! Queues, topic subscriptions and RPC queues become queue groups named after
//! the entity, so each message reaches one instance. Channels and reply queues
//! are plain subscriptions. Durable entities also get a JetStream stream that
//! retains the subject's traffic. Deliveries the sink fails on are republished
//! to the entity's dead-letter subject, when it has one.

use std::sync::Arc;

use anyhow::Context as _;
use async_nats::connection::State;
use async_nats::jetstream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use switchyard::{
    CreationStrategy, Delivery, DisposeStrategy, EntityInfo, EntityKind, InboundSink, MessageType, PublishStrategy,
    QueueSender, Strategies, StrategyFactory, SubscriptionStrategy,
};
use tracing::{debug, warn};

use crate::connector::NatsLink;
use crate::headers::{into_delivery, to_header_map};

/// JetStream stream name for a durable entity. Stream names may not contain
/// subject tokens, so anything that isn't alphanumeric becomes `_`.
pub fn stream_name(entity: &EntityInfo) -> String {
    entity
        .destination()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

async fn publish(link: &NatsLink, subject: &str, delivery: Delivery) -> anyhow::Result<()> {
    let headers = to_header_map(&delivery.headers);
    link.client()
        .publish_with_headers(subject.to_owned(), headers, delivery.body)
        .await
        .with_context(|| format!("failed to publish to {subject}"))
}

// =============================================================================
// Strategies
// =============================================================================

struct NatsCreation;

#[async_trait]
impl CreationStrategy<NatsLink> for NatsCreation {
    async fn create(&self, link: &NatsLink, entity: &EntityInfo) -> anyhow::Result<()> {
        if let Some(partitions) = entity.options.partitions {
            debug!(entity = %entity, partitions, "nats subjects are not partitioned, ignoring");
        }
        if !entity.options.durable {
            // Subjects need no declaration; just make sure the link is usable.
            anyhow::ensure!(
                matches!(link.client().connection_state(), State::Connected),
                "nats link for {} is not connected",
                entity.bus
            );
            return Ok(());
        }

        let config = stream::Config {
            name: stream_name(entity),
            subjects: vec![entity.destination().to_owned()],
            max_age: entity.options.message_ttl.unwrap_or_default(),
            ..Default::default()
        };
        link.jetstream()
            .get_or_create_stream(config)
            .await
            .with_context(|| format!("failed to declare stream for {entity}"))?;
        debug!(entity = %entity, "stream declared");
        Ok(())
    }
}

struct NatsSubscription;

#[async_trait]
impl SubscriptionStrategy<NatsLink> for NatsSubscription {
    async fn subscribe(&self, link: &NatsLink, entity: &EntityInfo, sink: Arc<dyn InboundSink>) -> anyhow::Result<()> {
        let subject = entity.destination().to_owned();
        let subscriber = if entity.kind.is_competing() {
            link.client()
                .queue_subscribe(subject.clone(), entity.name.clone())
                .await
        } else {
            link.client().subscribe(subject.clone()).await
        }
        .with_context(|| format!("failed to subscribe {entity}"))?;

        // Make sure the server has the interest before anyone publishes.
        link.client()
            .flush()
            .await
            .with_context(|| format!("failed to flush subscription for {entity}"))?;

        let info = entity.clone();
        let client = link.client().clone();
        let limit = entity.options.max_in_flight.unwrap_or(1).max(1);
        let pump = tokio::spawn(async move {
            subscriber
                .for_each_concurrent(limit, |message| {
                    let sink = sink.clone();
                    let client = &client;
                    let info = &info;
                    async move {
                        let delivery = match into_delivery(&message) {
                            Ok(delivery) => delivery,
                            Err(e) => {
                                warn!(entity = %info, error = %e, "dropping message with bad headers");
                                return;
                            }
                        };
                        if !info.matches_route(delivery.headers.route_key()) {
                            return;
                        }
                        let parked = info.options.dead_letter.as_ref().map(|_| delivery.clone());
                        if let Err(e) = sink.deliver(delivery).await {
                            warn!(entity = %info, error = %e, "delivery failed");
                            if let (Some(destination), Some(parked)) = (&info.options.dead_letter, parked) {
                                let headers = to_header_map(&parked.headers);
                                if let Err(e) = client
                                    .publish_with_headers(destination.clone(), headers, parked.body)
                                    .await
                                {
                                    warn!(entity = %info, destination = %destination, error = %e, "dead-lettering failed");
                                }
                            }
                        }
                    }
                })
                .await;
            debug!(entity = %info, "subscription ended");
        });
        link.replace_pump(&entity.name, pump);
        Ok(())
    }
}

struct NatsPublish;

#[async_trait]
impl PublishStrategy<NatsLink> for NatsPublish {
    async fn publish(
        &self,
        link: &NatsLink,
        entity: &EntityInfo,
        message_type: &MessageType,
        delivery: &Delivery,
    ) -> anyhow::Result<bool> {
        if !entity.accepts(message_type) {
            return Ok(false);
        }
        let mut delivery = delivery.clone();
        if let Some(key) = &entity.route_key {
            delivery.headers.set_route_key(key.clone());
        }
        publish(link, entity.destination(), delivery).await?;
        Ok(true)
    }
}

struct NatsDispose;

#[async_trait]
impl DisposeStrategy<NatsLink> for NatsDispose {
    async fn dispose(&self, link: &NatsLink, entity: &EntityInfo) -> anyhow::Result<()> {
        if link.stop_pump(&entity.name) {
            debug!(entity = %entity, "subscription stopped");
        }
        Ok(())
    }
}

/// Full lifecycle for consumer-side entities, publish only for references.
pub struct NatsStrategyFactory;

impl StrategyFactory<NatsLink> for NatsStrategyFactory {
    fn strategies(&self, kind: &EntityKind) -> Strategies<NatsLink> {
        match kind {
            EntityKind::Reference => Strategies::none().publish(Arc::new(NatsPublish)),
            _ => Strategies::none()
                .creation(Arc::new(NatsCreation))
                .subscription(Arc::new(NatsSubscription))
                .publish(Arc::new(NatsPublish))
                .dispose(Arc::new(NatsDispose)),
        }
    }
}

/// Sends RPC replies straight to the reply queue's subject.
pub struct NatsQueueSender;

#[async_trait]
impl QueueSender<NatsLink> for NatsQueueSender {
    async fn send(&self, link: &NatsLink, queue: &str, delivery: Delivery) -> anyhow::Result<()> {
        publish(link, queue, delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard::EntityOptions;

    #[test]
    fn test_stream_name_replaces_subject_tokens() {
        let queue = EntityInfo::new("main", "calc-rpc", EntityKind::Rpc);
        assert_eq!(stream_name(&queue), "CALC_RPC");

        let sub = EntityInfo::new(
            "main",
            "calc-audit",
            EntityKind::TopicSubscription {
                topic: "calc.events".into(),
            },
        )
        .with_options(EntityOptions::durable());
        assert_eq!(stream_name(&sub), "CALC_EVENTS");
    }

    #[test]
    fn test_references_only_publish() {
        let strategies = NatsStrategyFactory.strategies(&EntityKind::Reference);
        assert!(strategies.publish.is_some());
        assert!(strategies.creation.is_none());
        assert!(strategies.subscription.is_none());
        assert!(strategies.dispose.is_none());
    }

    #[test]
    fn test_consumer_entities_get_full_lifecycle() {
        for kind in [EntityKind::Queue, EntityKind::Channel, EntityKind::Rpc, EntityKind::ReplyQueue] {
            let strategies = NatsStrategyFactory.strategies(&kind);
            assert!(strategies.creation.is_some(), "{kind}");
            assert!(strategies.subscription.is_some(), "{kind}");
            assert!(strategies.publish.is_some(), "{kind}");
            assert!(strategies.dispose.is_some(), "{kind}");
        }
    }
}
