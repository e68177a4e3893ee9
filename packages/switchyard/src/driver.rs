//! The bus driver: entity lifecycle for one bus.
//!
//! ```text
//! start ──▶ create every entity ──▶ subscribe every entity ──▶ spawn reconnect worker
//!                                                                   │
//!   ConnectionEvent::Reconnected(bus) ─────────────────────────────┘
//!       └─▶ create again ──▶ subscribe again   (failures logged, retried next time)
//!
//! shutdown ──▶ stop worker ──▶ dispose in reverse order
//! ```
//!
//! Publishing never waits for a reconnect. While the bus is down it fails
//! with [`EntityError::NotConnected`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::ReplyAddress;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::core::{Command, DomainEvent, MessageType, Query};
use crate::dispatch::Dispatcher;
use crate::entity::BusEntity;
use crate::error::{BusError, EntityError};
use crate::headers::Headers;
use crate::transport::{Delivery, Outbound, QueueSender, ReplySender};

// =============================================================================
// Bus Driver
// =============================================================================

/// Builder for [`BusDriver`].
pub struct BusDriverBuilder<T> {
    bus: String,
    manager: Arc<ConnectionManager<T>>,
    dispatcher: Dispatcher,
    entities: Vec<BusEntity<T>>,
}

impl<T: Send + Sync + 'static> BusDriverBuilder<T> {
    pub fn entity(mut self, entity: BusEntity<T>) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entities(mut self, entities: impl IntoIterator<Item = BusEntity<T>>) -> Self {
        self.entities.extend(entities);
        self
    }

    pub fn build(self) -> BusDriver<T> {
        BusDriver {
            inner: Arc::new(DriverInner {
                bus: self.bus,
                manager: self.manager,
                dispatcher: self.dispatcher,
                entities: self.entities,
                started: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }
}

struct DriverInner<T> {
    bus: String,
    manager: Arc<ConnectionManager<T>>,
    dispatcher: Dispatcher,
    /// Declaration order. Fixed once built.
    entities: Vec<BusEntity<T>>,
    started: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Drives every entity on one bus through its lifecycle.
pub struct BusDriver<T> {
    inner: Arc<DriverInner<T>>,
}

impl<T> Clone for BusDriver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> BusDriver<T> {
    pub fn builder(
        bus: impl Into<String>,
        manager: Arc<ConnectionManager<T>>,
        dispatcher: Dispatcher,
    ) -> BusDriverBuilder<T> {
        BusDriverBuilder {
            bus: bus.into(),
            manager,
            dispatcher,
            entities: Vec::new(),
        }
    }

    pub fn bus(&self) -> &str {
        &self.inner.bus
    }

    pub fn entities(&self) -> &[BusEntity<T>] {
        &self.inner.entities
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Create every entity, then subscribe every entity, then start
    /// listening for reconnects.
    ///
    /// # Errors
    ///
    /// The first creation or subscription failure. Nothing is rolled back;
    /// call [`shutdown`](Self::shutdown) to dispose what was created.
    pub async fn start(&self) -> Result<(), EntityError> {
        let inner = &self.inner;
        // Subscribe first so a reconnect during startup is not missed.
        let events = inner.manager.subscribe();
        let transport = inner.transport()?;

        for entity in &inner.entities {
            if let Some(creation) = &entity.strategies().creation {
                creation
                    .create(&transport, entity.info())
                    .await
                    .map_err(|source| EntityError::CreationFailed {
                        bus: inner.bus.clone(),
                        entity: entity.name().to_owned(),
                        source,
                    })?;
                debug!(bus = %inner.bus, entity = %entity.info(), "entity created");
            }
        }

        for entity in &inner.entities {
            if let (Some(subscription), Some(sink)) = (&entity.strategies().subscription, entity.sink()) {
                subscription
                    .subscribe(&transport, entity.info(), sink.clone())
                    .await
                    .map_err(|source| EntityError::SubscriptionFailed {
                        bus: inner.bus.clone(),
                        entity: entity.name().to_owned(),
                        source,
                    })?;
                debug!(bus = %inner.bus, entity = %entity.info(), "entity subscribed");
            }
        }

        let worker = tokio::spawn(reconnect_worker(Arc::downgrade(&self.inner), events));
        if let Some(previous) = inner.lock_worker().replace(worker) {
            previous.abort();
        }
        inner.started.store(true, Ordering::Release);
        info!(bus = %inner.bus, entities = inner.entities.len(), "bus started");
        Ok(())
    }

    /// Re-run creation and subscription for every entity that has them.
    ///
    /// Returns how many steps failed. Failures are logged and left for the
    /// next reconnect.
    pub async fn reapply(&self) -> usize {
        self.inner.reapply().await
    }

    /// Enrich, encode and hand the message to every accepting entity.
    ///
    /// Returns how many entities accepted it.
    ///
    /// # Errors
    ///
    /// - [`EntityError::NotConnected`] while the bus is down
    /// - [`EntityError::NoPublisher`] when no entity accepts the type
    /// - [`EntityError::PublishFailed`] on the first strategy failure
    pub async fn publish_message(
        &self,
        message_type: &MessageType,
        mut headers: Headers,
        message: &(dyn erased_serde::Serialize + Sync),
    ) -> Result<usize, BusError> {
        let inner = &self.inner;
        if inner.manager.state(&inner.bus) != ConnectionState::Connected {
            return Err(EntityError::NotConnected {
                bus: inner.bus.clone(),
            }
            .into());
        }
        let transport = inner.transport()?;

        inner.dispatcher.enrich(message_type, &mut headers)?;
        let serializer = inner
            .dispatcher
            .serializers()
            .negotiate(headers.content_type())?;
        headers.set_content_type(serializer.content_type());
        let body = serializer.serialize(message)?;
        let delivery = Delivery::new(headers, body);

        let mut accepted = 0;
        for entity in &inner.entities {
            let Some(publish) = &entity.strategies().publish else {
                continue;
            };
            let took = publish
                .publish(&transport, entity.info(), message_type, &delivery)
                .await
                .map_err(|source| EntityError::PublishFailed {
                    bus: inner.bus.clone(),
                    entity: entity.name().to_owned(),
                    source,
                })?;
            if took {
                accepted += 1;
            }
        }

        if accepted == 0 {
            return Err(EntityError::NoPublisher {
                bus: inner.bus.clone(),
                message_type: message_type.name(),
            }
            .into());
        }
        debug!(
            bus = %inner.bus,
            message_type = message_type.name(),
            accepted,
            "message published"
        );
        Ok(accepted)
    }

    pub async fn send_command<C: Command + Serialize>(&self, command: &C, headers: Headers) -> Result<usize, BusError> {
        self.publish_message(&MessageType::command::<C>(), headers, command)
            .await
    }

    pub async fn send_query<Q: Query + Serialize>(&self, query: &Q, headers: Headers) -> Result<usize, BusError> {
        self.publish_message(&MessageType::query::<Q>(), headers, query)
            .await
    }

    pub async fn publish_event<E: DomainEvent + Serialize>(&self, event: &E, headers: Headers) -> Result<usize, BusError> {
        self.publish_message(&MessageType::event::<E>(), headers, event)
            .await
    }

    /// Stop the reconnect worker and dispose entities in reverse order.
    ///
    /// Every entity is disposed even when an earlier one fails.
    ///
    /// # Errors
    ///
    /// The first dispose failure.
    pub async fn shutdown(&self) -> Result<(), EntityError> {
        let inner = &self.inner;
        if let Some(worker) = inner.lock_worker().take() {
            worker.abort();
        }
        inner.started.store(false, Ordering::Release);

        let Some(transport) = inner.manager.transport(&inner.bus) else {
            warn!(bus = %inner.bus, "shutdown without transport, nothing disposed");
            return Ok(());
        };

        let mut first_error = None;
        for entity in inner.entities.iter().rev() {
            let Some(dispose) = &entity.strategies().dispose else {
                continue;
            };
            if let Err(source) = dispose.dispose(&transport, entity.info()).await {
                warn!(bus = %inner.bus, entity = %entity.info(), error = %source, "dispose failed");
                first_error.get_or_insert(EntityError::DisposeFailed {
                    bus: inner.bus.clone(),
                    entity: entity.name().to_owned(),
                    source,
                });
            }
        }
        info!(bus = %inner.bus, "bus stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl<T: Send + Sync + 'static> DriverInner<T> {
    fn transport(&self) -> Result<Arc<T>, EntityError> {
        self.manager
            .transport(&self.bus)
            .ok_or_else(|| EntityError::NotConnected {
                bus: self.bus.clone(),
            })
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn reapply(&self) -> usize {
        let transport = match self.transport() {
            Ok(t) => t,
            Err(e) => {
                warn!(bus = %self.bus, error = %e, "reapply skipped");
                return 1;
            }
        };

        let mut failures = 0;
        let mut created = vec![true; self.entities.len()];

        for (i, entity) in self.entities.iter().enumerate() {
            let Some(creation) = &entity.strategies().creation else {
                continue;
            };
            if let Err(e) = creation.create(&transport, entity.info()).await {
                warn!(bus = %self.bus, entity = %entity.info(), error = %e, "re-create failed");
                created[i] = false;
                failures += 1;
            }
        }

        for (i, entity) in self.entities.iter().enumerate() {
            let (Some(subscription), Some(sink)) = (&entity.strategies().subscription, entity.sink()) else {
                continue;
            };
            if !created[i] {
                continue;
            }
            if let Err(e) = subscription
                .subscribe(&transport, entity.info(), sink.clone())
                .await
            {
                warn!(bus = %self.bus, entity = %entity.info(), error = %e, "re-subscribe failed");
                failures += 1;
            }
        }

        if failures == 0 {
            info!(bus = %self.bus, "entities re-applied");
        }
        failures
    }
}

async fn reconnect_worker<T: Send + Sync + 'static>(
    driver: Weak<DriverInner<T>>,
    mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let reapply = match events.recv().await {
            Ok(ConnectionEvent::Reconnected { bus }) => {
                let Some(inner) = driver.upgrade() else { break };
                bus == inner.bus
            }
            Ok(_) => false,
            Err(RecvError::Lagged(n)) => {
                // A reconnect may be among the missed events.
                warn!(missed = n, "connection events lagged, re-applying");
                true
            }
            Err(RecvError::Closed) => break,
        };

        if reapply {
            let Some(inner) = driver.upgrade() else { break };
            inner.reapply().await;
        }
    }
    debug!("reconnect worker stopped");
}

#[async_trait]
impl<T: Send + Sync + 'static> Outbound for BusDriver<T> {
    async fn send_message(
        &self,
        message_type: &MessageType,
        headers: Headers,
        message: &(dyn erased_serde::Serialize + Sync),
    ) -> Result<usize, BusError> {
        self.publish_message(message_type, headers, message).await
    }
}

impl<T> fmt::Debug for BusDriver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusDriver")
            .field("bus", &self.inner.bus)
            .field("entities", &self.inner.entities)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Replies
// =============================================================================

/// Sends replies on one bus through its current transport.
pub struct TransportReplySender<T> {
    bus: String,
    manager: Arc<ConnectionManager<T>>,
    sender: Arc<dyn QueueSender<T>>,
}

impl<T> TransportReplySender<T> {
    pub fn new(bus: impl Into<String>, manager: Arc<ConnectionManager<T>>, sender: Arc<dyn QueueSender<T>>) -> Self {
        Self {
            bus: bus.into(),
            manager,
            sender,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> ReplySender for TransportReplySender<T> {
    async fn send_reply(&self, queue: &str, delivery: Delivery) -> Result<(), BusError> {
        let transport = self
            .manager
            .transport(&self.bus)
            .ok_or_else(|| EntityError::NotConnected {
                bus: self.bus.clone(),
            })?;
        self.sender
            .send(&transport, queue, delivery)
            .await
            .map_err(|source| {
                EntityError::PublishFailed {
                    bus: self.bus.clone(),
                    entity: queue.to_owned(),
                    source,
                }
                .into()
            })
    }
}

/// Routes replies to the bus named in their reply-to address.
///
/// Cheap to clone; clones share one table, so senders can be added after
/// responders that hold the router are built.
#[derive(Clone, Default)]
pub struct ReplyRouter {
    senders: Arc<DashMap<String, Arc<dyn ReplySender>>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, bus: impl Into<String>, sender: Arc<dyn ReplySender>) -> &Self {
        self.senders.insert(bus.into(), sender);
        self
    }

    pub fn has_route(&self, bus: &str) -> bool {
        self.senders.contains_key(bus)
    }

    /// # Errors
    ///
    /// [`EntityError::UnknownBus`] when no sender is registered for the bus.
    pub async fn send(&self, to: &ReplyAddress, delivery: Delivery) -> Result<(), BusError> {
        let sender = self
            .senders
            .get(to.bus())
            .map(|s| s.value().clone())
            .ok_or_else(|| EntityError::UnknownBus {
                bus: to.bus().to_owned(),
            })?;
        sender.send_reply(to.queue(), delivery).await
    }
}

impl fmt::Debug for ReplyRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buses: Vec<String> = self.senders.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ReplyRouter").field("buses", &buses).finish()
    }
}

// =============================================================================
// Multi-bus Startup
// =============================================================================

/// Lifecycle of one bus, independent of its transport type.
#[async_trait]
pub trait BusLifecycle: Send + Sync {
    fn bus(&self) -> &str;
    async fn start(&self) -> Result<(), EntityError>;
    async fn shutdown(&self) -> Result<(), EntityError>;
}

#[async_trait]
impl<T: Send + Sync + 'static> BusLifecycle for BusDriver<T> {
    fn bus(&self) -> &str {
        BusDriver::bus(self)
    }

    async fn start(&self) -> Result<(), EntityError> {
        BusDriver::start(self).await
    }

    async fn shutdown(&self) -> Result<(), EntityError> {
        BusDriver::shutdown(self).await
    }
}

/// Outcome of [`start_buses`].
#[derive(Debug, Default)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, EntityError)>,
}

impl StartupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// # Errors
    ///
    /// [`EntityError::StartupFailed`] naming every failed bus.
    pub fn into_result(self) -> Result<Vec<String>, EntityError> {
        if self.failed.is_empty() {
            Ok(self.started)
        } else {
            Err(EntityError::StartupFailed {
                buses: self.failed.into_iter().map(|(bus, _)| bus).collect(),
            })
        }
    }
}

/// Start every bus concurrently. One bus failing doesn't stop the others.
pub async fn start_buses(buses: &[&dyn BusLifecycle]) -> StartupReport {
    let outcomes = join_all(buses.iter().map(|b| async move { (b.bus().to_owned(), b.start().await) })).await;

    let mut report = StartupReport::default();
    for (bus, outcome) in outcomes {
        match outcome {
            Ok(()) => report.started.push(bus),
            Err(e) => {
                error!(bus = %bus, error = %e, "bus failed to start");
                report.failed.push((bus, e));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Message;
    use crate::entity::{EntityInfo, EntityKind};
    use crate::testing::{InMemoryBroker, MemoryConnector, MemoryLink, MemoryStrategyFactory};
    use crate::connection::BusSettings;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping(u32);
    impl Message for Ping {}
    impl Command for Ping {
        type Result = ();
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unrouted;
    impl Message for Unrouted {}
    impl DomainEvent for Unrouted {}

    async fn connected(broker: &InMemoryBroker, bus: &str) -> Arc<ConnectionManager<MemoryLink>> {
        let manager = Arc::new(ConnectionManager::new());
        manager
            .connect(&MemoryConnector::new(broker.clone()), &BusSettings::new(bus, ["memory://"]))
            .await
            .unwrap();
        manager
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::builder("test").build().unwrap()
    }

    fn queue(name: &str) -> BusEntity<MemoryLink> {
        BusEntity::from_factory(EntityInfo::new("main", name, EntityKind::Queue), &MemoryStrategyFactory)
            .with_sink(Arc::new(crate::testing::RecordingSink::default()))
    }

    fn reference() -> BusEntity<MemoryLink> {
        BusEntity::from_factory(
            EntityInfo::reference("main", "pings").accepting(&MessageType::command::<Ping>()),
            &MemoryStrategyFactory,
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_start_creates_then_subscribes_in_order() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(queue("a"))
            .entity(queue("b"))
            .entity(reference())
            .build();

        driver.start().await.unwrap();
        assert!(driver.is_started());
        assert_eq!(
            broker.operations(),
            vec!["create a", "create b", "subscribe a", "subscribe b"]
        );
    }

    #[tokio::test]
    async fn test_creation_failure_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.fail_creation("b");
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(queue("a"))
            .entity(queue("b"))
            .build();

        let err = driver.start().await.unwrap_err();
        assert!(matches!(err, EntityError::CreationFailed { ref entity, .. } if entity == "b"));
        assert_eq!(broker.operations(), vec!["create a"]);
        assert!(!driver.is_started());
    }

    #[tokio::test]
    async fn test_reconnect_reapplies_lifecycle_entities_only() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(queue("a"))
            .entity(reference())
            .build();
        driver.start().await.unwrap();
        broker.clear_operations();

        broker.disconnect("main");
        broker.reconnect("main");

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.operations().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.operations(), vec!["create a", "subscribe a"]);
    }

    #[tokio::test]
    async fn test_reconnect_of_other_bus_is_ignored() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        manager
            .connect(&MemoryConnector::new(broker.clone()), &BusSettings::new("audit", ["memory://"]))
            .await
            .unwrap();
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(queue("a"))
            .build();
        driver.start().await.unwrap();
        broker.clear_operations();

        broker.disconnect("audit");
        broker.reconnect("audit");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.operations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_resubscribe_is_retried_on_next_reconnect() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(queue("a"))
            .build();
        driver.start().await.unwrap();

        broker.fail_subscription("a");
        assert_eq!(driver.reapply().await, 1);

        broker.heal("a");
        assert_eq!(driver.reapply().await, 0);
        assert_eq!(broker.subscriber_count("a"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_in_reverse_order() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(queue("a"))
            .entity(queue("b"))
            .build();
        driver.start().await.unwrap();
        broker.clear_operations();

        driver.shutdown().await.unwrap();
        assert_eq!(broker.operations(), vec!["dispose b", "dispose a"]);
        assert!(!driver.is_started());
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    #[tokio::test]
    async fn test_publish_counts_accepting_entities() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(reference())
            .entity(reference())
            .build();
        driver.start().await.unwrap();

        let accepted = driver.send_command(&Ping(1), Headers::new()).await.unwrap();
        assert_eq!(accepted, 2);

        let sent = broker.published("pings");
        assert_eq!(sent.len(), 2);
        let headers = &sent[0].headers;
        assert_eq!(headers.content_type(), Some("application/json"));
        assert_eq!(headers.source(), Some("test"));
        assert!(headers.message_id().is_some());
    }

    #[tokio::test]
    async fn test_publish_without_accepting_entity() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager, dispatcher())
            .entity(reference())
            .build();
        driver.start().await.unwrap();

        let err = driver
            .publish_event(&Unrouted, Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Entity(EntityError::NoPublisher { .. })));
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, "main").await;
        let driver = BusDriver::builder("main", manager.clone(), dispatcher())
            .entity(reference())
            .build();
        driver.start().await.unwrap();

        let mut state = manager.watch("main").unwrap();
        broker.disconnect("main");
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        let err = driver.send_command(&Ping(1), Headers::new()).await.unwrap_err();
        assert!(matches!(err, BusError::Entity(EntityError::NotConnected { .. })));
    }

    // =========================================================================
    // Replies and startup
    // =========================================================================

    #[tokio::test]
    async fn test_reply_router_unknown_bus() {
        let router = ReplyRouter::new();
        let to: ReplyAddress = "elsewhere:replies-1".parse().unwrap();
        let err = router.send(&to, Delivery::default()).await.unwrap_err();
        assert!(matches!(err, BusError::Entity(EntityError::UnknownBus { .. })));
    }

    #[tokio::test]
    async fn test_start_buses_reports_each_bus() {
        let broker = InMemoryBroker::new();
        broker.fail_creation("broken");
        let manager = connected(&broker, "main").await;
        manager
            .connect(&MemoryConnector::new(broker.clone()), &BusSettings::new("audit", ["memory://"]))
            .await
            .unwrap();

        let good = BusDriver::builder("main", manager.clone(), dispatcher())
            .entity(queue("a"))
            .build();
        let bad = BusDriver::builder("audit", manager, dispatcher())
            .entity(BusEntity::from_factory(
                EntityInfo::new("audit", "broken", EntityKind::Queue),
                &MemoryStrategyFactory,
            ))
            .build();

        let report = start_buses(&[&good, &bad]).await;
        assert_eq!(report.started, vec!["main"]);
        assert_eq!(report.failed.len(), 1);
        assert!(good.is_started());

        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "failed to start buses: audit");
    }
}
