//! Bus entities and their strategies.
//!
//! An entity is a named unit on one bus: a work queue, a topic subscription,
//! a channel, an RPC request queue, a reply queue, or a publish-only
//! reference to something another service owns. What an entity *does* on a
//! broker is delegated to four strategies, each generic over the transport
//! handle `T`:
//!
//! | Strategy       | When                         | Absent means              |
//! |----------------|------------------------------|---------------------------|
//! | Creation       | start, every reconnect       | nothing to declare        |
//! | Subscription   | start, every reconnect       | no inbound traffic        |
//! | Publish        | every outbound message       | never a publish target    |
//! | Dispose        | shutdown, reverse order      | nothing to tear down      |

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::MessageType;
use crate::error::BusError;
use crate::transport::Delivery;

// =============================================================================
// Entity Description
// =============================================================================

/// What kind of broker object an entity is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Work queue; each message goes to one consumer instance.
    Queue,
    /// Named subscription on a topic; each subscription gets every message.
    TopicSubscription { topic: String },
    /// Pub/sub channel; every instance gets every message.
    Channel,
    /// Request queue answered over RPC.
    Rpc,
    /// This caller's private reply queue.
    ReplyQueue,
    /// Publish-only handle on an entity owned elsewhere.
    Reference,
}

impl EntityKind {
    /// Whether inbound traffic is spread across instances rather than copied.
    pub fn is_competing(&self) -> bool {
        matches!(
            self,
            EntityKind::Queue | EntityKind::TopicSubscription { .. } | EntityKind::Rpc
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Queue => write!(f, "queue"),
            EntityKind::TopicSubscription { topic } => write!(f, "subscription on {topic}"),
            EntityKind::Channel => write!(f, "channel"),
            EntityKind::Rpc => write!(f, "rpc queue"),
            EntityKind::ReplyQueue => write!(f, "reply queue"),
            EntityKind::Reference => write!(f, "reference"),
        }
    }
}

/// Broker-side declaration options. Transports ignore what they can't honor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Remove once the last consumer goes away.
    pub auto_delete: bool,
    /// Unacknowledged deliveries a consumer may hold.
    pub max_in_flight: Option<usize>,
    pub message_ttl: Option<Duration>,
    /// Destination for deliveries the consumer failed on.
    pub dead_letter: Option<String>,
    /// Shard count, for brokers that partition entities.
    pub partitions: Option<u16>,
}

impl EntityOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter(mut self, destination: impl Into<String>) -> Self {
        self.dead_letter = Some(destination.into());
        self
    }
}

/// Everything a strategy needs to know about an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub bus: String,
    pub name: String,
    pub kind: EntityKind,
    pub options: EntityOptions,
    /// Subscription filter, or the key stamped on published messages.
    pub route_key: Option<String>,
    accepts: Vec<(TypeId, &'static str)>,
}

impl EntityInfo {
    pub fn new(bus: impl Into<String>, name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            bus: bus.into(),
            name: name.into(),
            kind,
            options: EntityOptions::default(),
            route_key: None,
            accepts: Vec::new(),
        }
    }

    /// A publish-only reference to a queue, topic or channel named `name`.
    pub fn reference(bus: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(bus, name, EntityKind::Reference)
    }

    pub fn with_options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_route_key(mut self, key: impl Into<String>) -> Self {
        self.route_key = Some(key.into());
        self
    }

    /// Publish messages of this type through the entity.
    pub fn accepting(mut self, message_type: &MessageType) -> Self {
        if !self.accepts(message_type) {
            self.accepts.push((message_type.id(), message_type.name()));
        }
        self
    }

    /// Whether the entity publishes this message type.
    pub fn accepts(&self, message_type: &MessageType) -> bool {
        self.accepts.iter().any(|(id, _)| *id == message_type.id())
    }

    pub fn accepted_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.accepts.iter().map(|(_, name)| *name)
    }

    /// Broker address traffic flows through: the topic for subscriptions,
    /// the entity name otherwise.
    pub fn destination(&self) -> &str {
        match &self.kind {
            EntityKind::TopicSubscription { topic } => topic,
            _ => &self.name,
        }
    }

    /// Whether a message with `key` belongs to this entity's subscription.
    ///
    /// Entities without a route key take everything.
    pub fn matches_route(&self, key: Option<&str>) -> bool {
        match (&self.route_key, key) {
            (None, _) => true,
            (Some(pattern), Some(key)) => route_key_matches(pattern, key),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for EntityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.bus, self.name)
    }
}

/// Dot-separated route key matching. `*` matches one segment, `#` matches
/// zero or more.
pub fn route_key_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                go(rest, key) || key.split_first().is_some_and(|(_, tail)| go(pattern, tail))
            }
            (Some((&"*", rest)), Some((_, tail))) => go(rest, tail),
            (Some((p, rest)), Some((k, tail))) => p == k && go(rest, tail),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

// =============================================================================
// Strategies
// =============================================================================

/// Receives deliveries for a subscribed entity.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BusError>;
}

/// Declares the entity on the broker. Must be idempotent.
#[async_trait]
pub trait CreationStrategy<T>: Send + Sync {
    async fn create(&self, transport: &T, entity: &EntityInfo) -> anyhow::Result<()>;
}

/// Attaches the entity's sink. Calling it again replaces the old attachment.
#[async_trait]
pub trait SubscriptionStrategy<T>: Send + Sync {
    async fn subscribe(
        &self,
        transport: &T,
        entity: &EntityInfo,
        sink: Arc<dyn InboundSink>,
    ) -> anyhow::Result<()>;
}

/// Sends an encoded message through the entity.
#[async_trait]
pub trait PublishStrategy<T>: Send + Sync {
    /// `Ok(false)` when the entity does not accept `message_type`.
    async fn publish(
        &self,
        transport: &T,
        entity: &EntityInfo,
        message_type: &MessageType,
        delivery: &Delivery,
    ) -> anyhow::Result<bool>;
}

/// Tears the entity down on shutdown.
#[async_trait]
pub trait DisposeStrategy<T>: Send + Sync {
    async fn dispose(&self, transport: &T, entity: &EntityInfo) -> anyhow::Result<()>;
}

/// The strategies one entity uses. Any of them may be absent.
pub struct Strategies<T> {
    pub creation: Option<Arc<dyn CreationStrategy<T>>>,
    pub subscription: Option<Arc<dyn SubscriptionStrategy<T>>>,
    pub publish: Option<Arc<dyn PublishStrategy<T>>>,
    pub dispose: Option<Arc<dyn DisposeStrategy<T>>>,
}

impl<T> Strategies<T> {
    pub fn none() -> Self {
        Self {
            creation: None,
            subscription: None,
            publish: None,
            dispose: None,
        }
    }

    pub fn creation(mut self, strategy: Arc<dyn CreationStrategy<T>>) -> Self {
        self.creation = Some(strategy);
        self
    }

    pub fn subscription(mut self, strategy: Arc<dyn SubscriptionStrategy<T>>) -> Self {
        self.subscription = Some(strategy);
        self
    }

    pub fn publish(mut self, strategy: Arc<dyn PublishStrategy<T>>) -> Self {
        self.publish = Some(strategy);
        self
    }

    pub fn dispose(mut self, strategy: Arc<dyn DisposeStrategy<T>>) -> Self {
        self.dispose = Some(strategy);
        self
    }
}

impl<T> Default for Strategies<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> Clone for Strategies<T> {
    fn clone(&self) -> Self {
        Self {
            creation: self.creation.clone(),
            subscription: self.subscription.clone(),
            publish: self.publish.clone(),
            dispose: self.dispose.clone(),
        }
    }
}

/// Picks strategies for each entity kind. One implementation per broker
/// technology.
pub trait StrategyFactory<T>: Send + Sync {
    fn strategies(&self, kind: &EntityKind) -> Strategies<T>;
}

// =============================================================================
// Bus Entity
// =============================================================================

/// An entity plus its strategies and, for subscribed entities, its sink.
pub struct BusEntity<T> {
    info: EntityInfo,
    sink: Option<Arc<dyn InboundSink>>,
    strategies: Strategies<T>,
}

impl<T> BusEntity<T> {
    pub fn new(info: EntityInfo, strategies: Strategies<T>) -> Self {
        Self {
            info,
            sink: None,
            strategies,
        }
    }

    /// Build an entity with the factory's strategies for its kind.
    pub fn from_factory(info: EntityInfo, factory: &dyn StrategyFactory<T>) -> Self {
        let strategies = factory.strategies(&info.kind);
        Self::new(info, strategies)
    }

    pub fn with_sink(mut self, sink: Arc<dyn InboundSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn sink(&self) -> Option<&Arc<dyn InboundSink>> {
        self.sink.as_ref()
    }

    pub fn strategies(&self) -> &Strategies<T> {
        &self.strategies
    }

    /// Whether reconnects have anything to re-apply for this entity.
    pub fn has_lifecycle(&self) -> bool {
        self.strategies.creation.is_some()
            || (self.strategies.subscription.is_some() && self.sink.is_some())
    }
}

impl<T> fmt::Debug for BusEntity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusEntity")
            .field("info", &self.info)
            .field("has_sink", &self.sink.is_some())
            .field("creation", &self.strategies.creation.is_some())
            .field("subscription", &self.strategies.subscription.is_some())
            .field("publish", &self.strategies.publish.is_some())
            .field("dispose", &self.strategies.dispose.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Command, DomainEvent, Message};

    #[derive(Debug, Clone)]
    struct Ping;
    impl Message for Ping {}
    impl Command for Ping {
        type Result = ();
    }

    #[derive(Debug, Clone)]
    struct Pinged;
    impl Message for Pinged {}
    impl DomainEvent for Pinged {}

    #[test]
    fn test_reference_accepts_declared_types_only() {
        let info = EntityInfo::reference("main", "pings")
            .accepting(&MessageType::command::<Ping>())
            .accepting(&MessageType::command::<Ping>());

        assert!(info.accepts(&MessageType::command::<Ping>()));
        assert!(!info.accepts(&MessageType::event::<Pinged>()));
        assert_eq!(info.accepted_types().count(), 1);
    }

    #[test]
    fn test_destination_is_topic_for_subscriptions() {
        let sub = EntityInfo::new(
            "main",
            "billing",
            EntityKind::TopicSubscription {
                topic: "orders".into(),
            },
        );
        assert_eq!(sub.destination(), "orders");
        assert_eq!(EntityInfo::new("main", "work", EntityKind::Queue).destination(), "work");
        assert_eq!(sub.to_string(), "subscription on orders main:billing");
    }

    #[test]
    fn test_route_key_patterns() {
        assert!(route_key_matches("orders.created", "orders.created"));
        assert!(!route_key_matches("orders.created", "orders.deleted"));
        assert!(route_key_matches("orders.*", "orders.created"));
        assert!(!route_key_matches("orders.*", "orders.created.eu"));
        assert!(route_key_matches("orders.#", "orders"));
        assert!(route_key_matches("orders.#", "orders.created.eu"));
        assert!(route_key_matches("#.eu", "orders.created.eu"));
        assert!(!route_key_matches("*.eu", "orders.created.eu"));
    }

    #[test]
    fn test_entity_without_route_key_takes_everything() {
        let open = EntityInfo::new("main", "all", EntityKind::Channel);
        assert!(open.matches_route(None));
        assert!(open.matches_route(Some("a.b")));

        let keyed = open.with_route_key("a.*");
        assert!(keyed.matches_route(Some("a.b")));
        assert!(!keyed.matches_route(None));
    }

    #[test]
    fn test_publish_only_entity_has_no_lifecycle() {
        struct Noop;

        #[async_trait]
        impl PublishStrategy<()> for Noop {
            async fn publish(
                &self,
                _t: &(),
                _e: &EntityInfo,
                _m: &MessageType,
                _d: &Delivery,
            ) -> anyhow::Result<bool> {
                Ok(true)
            }
        }

        let entity = BusEntity::new(
            EntityInfo::reference("main", "pings"),
            Strategies::none().publish(Arc::new(Noop)),
        );
        assert!(!entity.has_lifecycle());
    }
}
