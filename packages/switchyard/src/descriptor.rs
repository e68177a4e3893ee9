//! Consumers and the descriptors that bind them to message types.
//!
//! A [`Descriptor`] is built once by a [`Router`](crate::router::Router) and
//! never changes afterwards. It records:
//! - the message type it matches, and whether derived types match too
//! - where the consumer comes from (a shared instance or a per-scope factory)
//! - an optional predicate over the message and its headers
//! - optional broker route metadata and a wire codec

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::{AnyMessage, AnyOutput, Message, MessageType};
use crate::entity::{EntityKind, EntityOptions};
use crate::error::BusError;
use crate::headers::{CorrelationId, Headers};
use crate::serializer::WireCodec;

// =============================================================================
// Consumers
// =============================================================================

/// Handles one message type.
///
/// Consumers are **stateless** with respect to a single message: everything
/// they need arrives in the message and the [`ConsumeContext`]. Use
/// `Routes::*_scoped` when a consumer needs a fresh instance per message.
///
/// # Example
///
/// ```ignore
/// struct RangeCalculator;
///
/// #[async_trait]
/// impl Consumer<CalculateRange> for RangeCalculator {
///     type Output = Range;
///
///     async fn consume(&self, cmd: CalculateRange, _ctx: ConsumeContext) -> Result<Range> {
///         let min = cmd.values.iter().copied().min().context("no values")?;
///         let max = cmd.values.iter().copied().max().context("no values")?;
///         Ok(Range { min, max })
///     }
/// }
/// ```
#[async_trait]
pub trait Consumer<M: Message>: Send + Sync + 'static {
    /// What the consumer returns. For commands and queries this is mapped to
    /// the declared result type when the two differ.
    type Output: Send + Sync + 'static;

    async fn consume(&self, message: M, ctx: ConsumeContext) -> anyhow::Result<Self::Output>;
}

/// Identifies one execution scope (one broker delivery or one local call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context passed to consumers.
///
/// Immutable and cheap to clone.
#[derive(Clone)]
pub struct ConsumeContext {
    headers: Arc<Headers>,
    scope: ScopeId,
    consumer: &'static str,
}

impl ConsumeContext {
    pub(crate) fn new(headers: Arc<Headers>, scope: ScopeId, consumer: &'static str) -> Self {
        Self {
            headers,
            scope,
            consumer,
        }
    }

    /// Headers of the message being consumed, after enrichment.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Correlation id of the causal chain.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.headers.correlation_id()
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn consumer(&self) -> &'static str {
        self.consumer
    }

    /// Headers for a message this consumer sends as a consequence of the
    /// current one. Carries the correlation id forward.
    pub fn follow_up(&self) -> Headers {
        self.headers.follow_up()
    }
}

/// Type-erased consumer, so descriptors for different message types can live
/// in one table.
#[async_trait]
pub(crate) trait AnyConsumer: Send + Sync {
    async fn consume_any(
        &self,
        message: AnyMessage,
        ctx: ConsumeContext,
    ) -> Result<AnyOutput, BusError>;
}

/// Wrapper to make concrete consumers implement [`AnyConsumer`].
pub(crate) struct ConsumerWrapper<H, M> {
    consumer: H,
    _message: PhantomData<fn(M)>,
}

impl<H, M> ConsumerWrapper<H, M> {
    pub(crate) fn new(consumer: H) -> Self {
        Self {
            consumer,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<H, M> AnyConsumer for ConsumerWrapper<H, M>
where
    H: Consumer<M>,
    M: Message,
{
    async fn consume_any(
        &self,
        message: AnyMessage,
        ctx: ConsumeContext,
    ) -> Result<AnyOutput, BusError> {
        let consumer = ctx.consumer();
        let message = message.downcast::<M>().map_err(|_| {
            BusError::handler(
                consumer,
                anyhow::anyhow!(
                    "message type mismatch: expected {}",
                    std::any::type_name::<M>()
                ),
            )
        })?;

        self.consumer
            .consume(*message, ctx)
            .await
            .map(|out| Box::new(out) as AnyOutput)
            .map_err(|e| BusError::handler(consumer, e))
    }
}

/// Where a descriptor gets its consumer instance from.
#[derive(Clone)]
pub(crate) enum ConsumerSource {
    /// One instance shared by every invocation.
    Shared(Arc<dyn AnyConsumer>),
    /// A fresh instance per scope.
    PerScope(Arc<dyn Fn() -> Arc<dyn AnyConsumer> + Send + Sync>),
}

impl ConsumerSource {
    pub(crate) fn instance(&self) -> Arc<dyn AnyConsumer> {
        match self {
            ConsumerSource::Shared(c) => c.clone(),
            ConsumerSource::PerScope(factory) => factory(),
        }
    }

    fn is_scoped(&self) -> bool {
        matches!(self, ConsumerSource::PerScope(_))
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Runtime identity of a value type (consumer output or declared result).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeInfo {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Predicate over the message as the descriptor sees it (possibly upcast).
pub(crate) type Predicate = Arc<dyn Fn(&(dyn Any + Send + Sync), &Headers) -> bool + Send + Sync>;

/// Where a descriptor's messages live on a broker.
///
/// Opaque to the dispatch table; the entity planner turns it into a
/// [`BusEntity`](crate::entity::BusEntity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMetadata {
    pub bus: String,
    pub entity: String,
    pub kind: EntityKind,
    pub route_key: Option<String>,
    pub options: EntityOptions,
}

impl RouteMetadata {
    /// A work queue with one consumer.
    pub fn queue(bus: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::new(bus, queue, EntityKind::Queue)
    }

    /// A named subscription on a topic.
    pub fn topic(
        bus: impl Into<String>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Self {
        Self::new(
            bus,
            subscription,
            EntityKind::TopicSubscription {
                topic: topic.into(),
            },
        )
    }

    /// A pub/sub channel every instance receives.
    pub fn channel(bus: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(bus, channel, EntityKind::Channel)
    }

    /// A request queue answered over RPC. Several routes may share one queue.
    pub fn rpc(bus: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::new(bus, queue, EntityKind::Rpc)
    }

    fn new(bus: impl Into<String>, entity: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            bus: bus.into(),
            entity: entity.into(),
            kind,
            route_key: None,
            options: EntityOptions::default(),
        }
    }

    pub fn route_key(mut self, key: impl Into<String>) -> Self {
        self.route_key = Some(key.into());
        self
    }

    pub fn options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }
}

/// Immutable binding of a message type to its consumer and matching rules.
pub struct Descriptor {
    pub(crate) seq: usize,
    pub(crate) message_type: MessageType,
    pub(crate) consumer: &'static str,
    pub(crate) router: &'static str,
    pub(crate) source: ConsumerSource,
    pub(crate) output: TypeInfo,
    pub(crate) declared: Option<TypeInfo>,
    pub(crate) namespace: Option<&'static str>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) include_derived: bool,
    pub(crate) route: Option<RouteMetadata>,
    pub(crate) codec: Option<Arc<dyn WireCodec>>,
}

impl Descriptor {
    /// Registration order across every router.
    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    /// Type name of the consumer.
    pub fn consumer_name(&self) -> &'static str {
        self.consumer
    }

    /// Type name of the router that registered this descriptor.
    pub fn router_name(&self) -> &'static str {
        self.router
    }

    /// Consumer output type.
    pub fn output(&self) -> TypeInfo {
        self.output
    }

    /// Declared result type. `None` for domain events.
    pub fn declared_result(&self) -> Option<TypeInfo> {
        self.declared
    }

    /// RPC namespace of the command or query.
    pub fn namespace(&self) -> Option<&'static str> {
        self.namespace
    }

    pub fn include_derived(&self) -> bool {
        self.include_derived
    }

    pub fn is_scoped(&self) -> bool {
        self.source.is_scoped()
    }

    pub fn route(&self) -> Option<&RouteMetadata> {
        self.route.as_ref()
    }

    pub(crate) fn codec(&self) -> Option<&Arc<dyn WireCodec>> {
        self.codec.as_ref()
    }

    pub(crate) fn matches(&self, message: &(dyn Any + Send + Sync), headers: &Headers) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(message, headers))
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("seq", &self.seq)
            .field("message_type", &self.message_type.name())
            .field("consumer", &self.consumer)
            .field("router", &self.router)
            .field("include_derived", &self.include_derived)
            .field("has_predicate", &self.predicate.is_some())
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Command, DomainEvent};

    #[derive(Debug, Clone)]
    struct Ping(u32);
    impl Message for Ping {}
    impl DomainEvent for Ping {}

    #[derive(Debug)]
    struct Double(u32);
    impl Message for Double {}
    impl Command for Double {
        type Result = u32;
    }

    struct Doubler;

    #[async_trait]
    impl Consumer<Double> for Doubler {
        type Output = u32;

        async fn consume(&self, cmd: Double, _ctx: ConsumeContext) -> anyhow::Result<u32> {
            if cmd.0 == 0 {
                anyhow::bail!("zero");
            }
            Ok(cmd.0 * 2)
        }
    }

    fn ctx() -> ConsumeContext {
        ConsumeContext::new(Arc::new(Headers::correlated("c-1")), ScopeId::new(), "Doubler")
    }

    #[tokio::test]
    async fn test_wrapper_downcasts_and_boxes_output() {
        let wrapper = ConsumerWrapper::<_, Double>::new(Doubler);
        let out = wrapper.consume_any(Box::new(Double(21)), ctx()).await.unwrap();
        assert_eq!(out.downcast_ref::<u32>(), Some(&42));
    }

    #[tokio::test]
    async fn test_wrapper_names_failing_consumer() {
        let wrapper = ConsumerWrapper::<_, Double>::new(Doubler);
        let err = wrapper.consume_any(Box::new(Double(0)), ctx()).await.unwrap_err();
        match err {
            BusError::Handler { consumer, source } => {
                assert_eq!(consumer, "Doubler");
                assert_eq!(source.to_string(), "zero");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrapper_rejects_wrong_message_type() {
        let wrapper = ConsumerWrapper::<_, Double>::new(Doubler);
        let err = wrapper.consume_any(Box::new(Ping(1)), ctx()).await.unwrap_err();
        assert!(err.to_string().contains("message type mismatch"));
    }

    #[test]
    fn test_context_follow_up_carries_correlation() {
        let ctx = ctx();
        assert_eq!(ctx.correlation_id().map(|c| c.as_str()), Some("c-1"));
        assert_eq!(
            ctx.follow_up().correlation_id().map(|c| c.as_str()),
            Some("c-1")
        );
    }

    #[test]
    fn test_per_scope_source_builds_fresh_instances() {
        let source = ConsumerSource::PerScope(Arc::new(|| {
            Arc::new(ConsumerWrapper::<_, Double>::new(Doubler)) as Arc<dyn AnyConsumer>
        }));
        let a = source.instance();
        let b = source.instance();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(source.is_scoped());
    }

    #[test]
    fn test_route_metadata_builders() {
        let route = RouteMetadata::topic("main", "orders", "billing").route_key("orders.*");
        assert_eq!(route.entity, "billing");
        assert_eq!(
            route.kind,
            EntityKind::TopicSubscription {
                topic: "orders".into()
            }
        );
        assert_eq!(route.route_key.as_deref(), Some("orders.*"));
    }
}
