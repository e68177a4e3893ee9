//! In-memory broker for tests.
//!
//! Behaves like a small queueing broker: competing consumers on queues, RPC
//! queues and topic subscriptions, fan-out on channels and reply queues,
//! route-key filtering on topics. Deliveries run on spawned tasks like a real
//! consumer would; [`InMemoryBroker::settle`] waits for them.
//!
//! Every lifecycle step is logged (`"create a"`, `"subscribe a"`,
//! `"dispose a"`) and failures can be injected per entity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;

use crate::connection::{BusSettings, ConnectionSignals, Connector};
use crate::core::MessageType;
use crate::entity::{
    CreationStrategy, DisposeStrategy, EntityInfo, EntityKind, InboundSink, PublishStrategy, Strategies,
    StrategyFactory, SubscriptionStrategy,
};
use crate::error::BusError;
use crate::transport::{Delivery, QueueSender};

struct Subscription {
    bus: String,
    info: EntityInfo,
    group: Option<String>,
    sink: Arc<dyn InboundSink>,
}

struct Link {
    signals: ConnectionSignals,
    up: bool,
}

#[derive(Default)]
struct State {
    operations: Vec<String>,
    fail_creation: HashSet<String>,
    fail_subscription: HashSet<String>,
    links: HashMap<String, Link>,
    created: HashSet<(String, String)>,
    subscriptions: Vec<Subscription>,
    published: Vec<(String, Delivery)>,
    turn: usize,
}

/// A broker living in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Lifecycle steps so far, oldest first.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state().operations.clear();
    }

    /// Everything published to `destination`, on any bus.
    pub fn published(&self, destination: &str) -> Vec<Delivery> {
        self.state()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, delivery)| delivery.clone())
            .collect()
    }

    /// How many live subscriptions the entity `name` has.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.state()
            .subscriptions
            .iter()
            .filter(|s| s.info.name == name)
            .count()
    }

    pub fn is_created(&self, bus: &str, name: &str) -> bool {
        self.state().created.contains(&(bus.to_owned(), name.to_owned()))
    }

    /// Wait until every spawned delivery has finished.
    pub async fn settle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    pub fn fail_creation(&self, name: &str) {
        self.state().fail_creation.insert(name.to_owned());
    }

    pub fn fail_subscription(&self, name: &str) {
        self.state().fail_subscription.insert(name.to_owned());
    }

    /// Clear injected failures for `name`.
    pub fn heal(&self, name: &str) {
        let mut state = self.state();
        state.fail_creation.remove(name);
        state.fail_subscription.remove(name);
    }

    /// Drop the link to `bus`. Its subscriptions are lost, as on a real
    /// broker restart.
    pub fn disconnect(&self, bus: &str) {
        let signals = {
            let mut state = self.state();
            state.subscriptions.retain(|s| s.bus != bus);
            state.links.get_mut(bus).map(|link| {
                link.up = false;
                link.signals.clone()
            })
        };
        if let Some(signals) = signals {
            signals.disconnected();
        }
    }

    /// Restore the link to `bus`.
    pub fn reconnect(&self, bus: &str) {
        let signals = self.state().links.get_mut(bus).map(|link| {
            link.up = true;
            link.signals.clone()
        });
        if let Some(signals) = signals {
            signals.connected();
        }
    }

    // =========================================================================
    // Broker operations
    // =========================================================================

    fn ensure_up(&self, bus: &str) -> anyhow::Result<()> {
        match self.state().links.get(bus) {
            Some(link) if link.up => Ok(()),
            _ => anyhow::bail!("bus {bus} is disconnected"),
        }
    }

    fn create(&self, bus: &str, info: &EntityInfo) -> anyhow::Result<()> {
        self.ensure_up(bus)?;
        let mut state = self.state();
        if state.fail_creation.contains(&info.name) {
            anyhow::bail!("creation of {} refused", info.name);
        }
        state.operations.push(format!("create {}", info.name));
        state.created.insert((bus.to_owned(), info.name.clone()));
        Ok(())
    }

    fn subscribe(&self, bus: &str, info: &EntityInfo, sink: Arc<dyn InboundSink>) -> anyhow::Result<()> {
        self.ensure_up(bus)?;
        let mut state = self.state();
        if state.fail_subscription.contains(&info.name) {
            anyhow::bail!("subscription to {} refused", info.name);
        }
        state.operations.push(format!("subscribe {}", info.name));
        // Same sink on the same entity is a re-subscribe.
        state
            .subscriptions
            .retain(|s| !(s.bus == bus && s.info.name == info.name && same_sink(&s.sink, &sink)));
        let group = info.kind.is_competing().then(|| info.name.clone());
        state.subscriptions.push(Subscription {
            bus: bus.to_owned(),
            info: info.clone(),
            group,
            sink,
        });
        Ok(())
    }

    fn dispose(&self, bus: &str, info: &EntityInfo) {
        let mut state = self.state();
        state.operations.push(format!("dispose {}", info.name));
        state
            .subscriptions
            .retain(|s| !(s.bus == bus && s.info.name == info.name));
        state.created.remove(&(bus.to_owned(), info.name.clone()));
    }

    /// Record `delivery` and hand it to one subscriber per group.
    fn publish(&self, bus: &str, destination: &str, delivery: Delivery) -> anyhow::Result<()> {
        self.ensure_up(bus)?;
        let targets = {
            let mut state = self.state();
            state.published.push((destination.to_owned(), delivery.clone()));
            let turn = state.turn;
            state.turn = state.turn.wrapping_add(1);

            let mut groups: HashMap<&str, Vec<&Subscription>> = HashMap::new();
            let mut targets: Vec<(Arc<dyn InboundSink>, Option<String>)> = Vec::new();
            for sub in state.subscriptions.iter().filter(|s| {
                s.bus == bus
                    && s.info.destination() == destination
                    && s.info.matches_route(delivery.headers.route_key())
            }) {
                match &sub.group {
                    Some(group) => groups.entry(group.as_str()).or_default().push(sub),
                    None => targets.push((sub.sink.clone(), sub.info.options.dead_letter.clone())),
                }
            }
            let mut grouped: Vec<_> = groups.into_values().collect();
            grouped.sort_by(|a, b| a[0].info.name.cmp(&b[0].info.name));
            targets.extend(grouped.into_iter().map(|members| {
                let chosen = members[turn % members.len()];
                (chosen.sink.clone(), chosen.info.options.dead_letter.clone())
            }));
            targets
        };

        for (sink, dead_letter) in targets {
            self.spawn_delivery(bus, sink, delivery.clone(), dead_letter);
        }
        Ok(())
    }

    /// Deliver on a task. A failed delivery goes to `dead_letter`, if set.
    fn spawn_delivery(&self, bus: &str, sink: Arc<dyn InboundSink>, delivery: Delivery, dead_letter: Option<String>) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let broker = self.clone();
        let bus = bus.to_owned();
        tokio::spawn(async move {
            if let Err(error) = sink.deliver(delivery.clone()).await {
                warn!(error = %error, "in-memory delivery failed");
                if let Some(destination) = dead_letter {
                    if let Err(e) = broker.publish(&bus, &destination, delivery) {
                        warn!(destination = %destination, error = %e, "dead-lettering failed");
                    }
                }
            }
            if broker.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                broker.idle.notify_waiters();
            }
        });
    }
}

fn same_sink(a: &Arc<dyn InboundSink>, b: &Arc<dyn InboundSink>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// =============================================================================
// Transport
// =============================================================================

/// A connection to one bus of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct MemoryLink {
    broker: InMemoryBroker,
    bus: String,
}

impl MemoryLink {
    pub fn bus(&self) -> &str {
        &self.bus
    }
}

/// Connects to an [`InMemoryBroker`]. Always succeeds.
pub struct MemoryConnector {
    broker: InMemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Transport = MemoryLink;

    async fn connect(&self, settings: &BusSettings, signals: ConnectionSignals) -> anyhow::Result<MemoryLink> {
        self.broker
            .state()
            .links
            .insert(settings.bus.clone(), Link { signals, up: true });
        Ok(MemoryLink {
            broker: self.broker.clone(),
            bus: settings.bus.clone(),
        })
    }
}

// =============================================================================
// Strategies
// =============================================================================

struct MemoryCreation;

#[async_trait]
impl CreationStrategy<MemoryLink> for MemoryCreation {
    async fn create(&self, link: &MemoryLink, entity: &EntityInfo) -> anyhow::Result<()> {
        link.broker.create(&link.bus, entity)
    }
}

struct MemorySubscription;

#[async_trait]
impl SubscriptionStrategy<MemoryLink> for MemorySubscription {
    async fn subscribe(&self, link: &MemoryLink, entity: &EntityInfo, sink: Arc<dyn InboundSink>) -> anyhow::Result<()> {
        link.broker.subscribe(&link.bus, entity, sink)
    }
}

struct MemoryPublish;

#[async_trait]
impl PublishStrategy<MemoryLink> for MemoryPublish {
    async fn publish(
        &self,
        link: &MemoryLink,
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
        link.broker.publish(&link.bus, entity.destination(), delivery)?;
        Ok(true)
    }
}

struct MemoryDispose;

#[async_trait]
impl DisposeStrategy<MemoryLink> for MemoryDispose {
    async fn dispose(&self, link: &MemoryLink, entity: &EntityInfo) -> anyhow::Result<()> {
        link.broker.dispose(&link.bus, entity);
        Ok(())
    }
}

/// Full lifecycle for consumer-side entities, publish only for references.
pub struct MemoryStrategyFactory;

impl StrategyFactory<MemoryLink> for MemoryStrategyFactory {
    fn strategies(&self, kind: &EntityKind) -> Strategies<MemoryLink> {
        match kind {
            EntityKind::Reference => Strategies::none().publish(Arc::new(MemoryPublish)),
            _ => Strategies::none()
                .creation(Arc::new(MemoryCreation))
                .subscription(Arc::new(MemorySubscription))
                .publish(Arc::new(MemoryPublish))
                .dispose(Arc::new(MemoryDispose)),
        }
    }
}

/// Sends replies straight to a named queue.
pub struct MemoryQueueSender;

#[async_trait]
impl QueueSender<MemoryLink> for MemoryQueueSender {
    async fn send(&self, link: &MemoryLink, queue: &str, delivery: Delivery) -> anyhow::Result<()> {
        link.broker.publish(&link.bus, queue, delivery)
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Records every delivery it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl InboundSink for RecordingSink {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BusError> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery);
        Ok(())
    }
}
