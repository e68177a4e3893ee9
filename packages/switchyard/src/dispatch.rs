//! The dispatcher: local entry point for commands, queries and events.
//!
//! The `Dispatcher` is responsible for:
//! 1. Enriching headers before anything else sees them
//! 2. Resolving descriptors through the [`DispatchTable`]
//! 3. Running the query filter pipeline and result mapping
//! 4. Isolating consumer panics
//!
//! It is cheap to clone; clones share one table.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::builder("calc-service")
//!     .router(CalcRouter)
//!     .filter::<GetRange, _>(RangeCache::default())
//!     .map(|row: RangeRow| Range::from(row))
//!     .build()?;
//!
//! let range = dispatcher.send(CalculateRange { values: vec![3, 9, 1, 7] }).await?;
//! ```

use std::any::type_name;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::core::{AnyMessage, AnyOutput, Command, DomainEvent, MessageKind, MessageType, Query};
use crate::descriptor::{ConsumeContext, Descriptor, ScopeId};
use crate::enrich::{in_causal_chain, EnrichContext, Enricher, EnricherPipeline};
use crate::error::BusError;
use crate::filter::{QueryFilter, QueryFilters};
use crate::headers::Headers;
use crate::mapping::{ResultMapper, ResultSlot};
use crate::router::Router;
use crate::serializer::{Serializer, SerializerRegistry};
use crate::table::{DispatchTable, DispatchTableBuilder, Match};

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    service: String,
    table: DispatchTableBuilder,
    enrichers: EnricherPipeline,
    filters: QueryFilters,
    mapper: ResultMapper,
    serializers: SerializerRegistry,
}

impl DispatcherBuilder {
    pub fn router<R: Router>(mut self, router: R) -> Self {
        self.table = self.table.router(router);
        self
    }

    /// See [`DispatchTableBuilder::known`].
    pub fn known(mut self, message_type: MessageType) -> Self {
        self.table = self.table.known(message_type);
        self
    }

    /// Append an enricher after the ones already registered.
    pub fn enricher(mut self, enricher: impl Enricher + 'static) -> Self {
        self.enrichers.push(enricher);
        self
    }

    /// Remove every enricher, defaults included.
    pub fn clear_enrichers(mut self) -> Self {
        self.enrichers.clear();
        self
    }

    pub fn filter<Q, F>(mut self, filter: F) -> Self
    where
        Q: Query,
        F: QueryFilter<Q>,
    {
        self.filters.add::<Q, F>(filter);
        self
    }

    /// Register a result mapping, see [`ResultMapper::register`].
    pub fn map<S, T, F>(mut self, map: F) -> Self
    where
        S: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(S) -> T + Send + Sync + 'static,
    {
        self.mapper.register(map);
        self
    }

    /// Add a serializer for broker payloads. JSON is always available.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.register(serializer);
        self
    }

    /// Build the table and freeze the pipelines.
    ///
    /// # Errors
    ///
    /// Structural errors from [`DispatchTableBuilder::build`].
    pub fn build(self) -> Result<Dispatcher, BusError> {
        let table = self.table.build()?;
        Ok(Dispatcher {
            inner: Arc::new(Inner {
                service: self.service,
                table,
                enrichers: self.enrichers,
                filters: self.filters,
                mapper: self.mapper,
                serializers: self.serializers,
            }),
        })
    }
}

struct Inner {
    service: String,
    table: DispatchTable,
    enrichers: EnricherPipeline,
    filters: QueryFilters,
    mapper: ResultMapper,
    serializers: SerializerRegistry,
}

/// Routes messages to consumers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Start building a dispatcher for the named service.
    pub fn builder(service: impl Into<String>) -> DispatcherBuilder {
        DispatcherBuilder {
            service: service.into(),
            table: DispatchTable::builder(),
            enrichers: EnricherPipeline::with_defaults(),
            filters: QueryFilters::new(),
            mapper: ResultMapper::new(),
            serializers: SerializerRegistry::default(),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn table(&self) -> &DispatchTable {
        &self.inner.table
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.inner.serializers
    }

    /// Run the enricher pipeline over `headers`.
    pub fn enrich(&self, message_type: &MessageType, headers: &mut Headers) -> Result<(), BusError> {
        let ctx = EnrichContext::new(message_type, &self.inner.service);
        self.inner.enrichers.run(headers, &ctx)?;
        Ok(())
    }

    // =========================================================================
    // Typed API
    // =========================================================================

    /// Send a command to its consumer and return the declared result.
    pub async fn send<C: Command>(&self, command: C) -> Result<C::Result, BusError> {
        self.send_with(Headers::new(), command).await
    }

    pub async fn send_with<C: Command>(
        &self,
        headers: Headers,
        command: C,
    ) -> Result<C::Result, BusError> {
        let out = self
            .dispatch(&MessageType::command::<C>(), Box::new(command), headers)
            .await?;
        take_result::<C::Result>(out)
    }

    /// Ask a query and return the declared result, after filters.
    pub async fn ask<Q: Query>(&self, query: Q) -> Result<Q::Result, BusError> {
        self.ask_with(Headers::new(), query).await
    }

    pub async fn ask_with<Q: Query>(&self, headers: Headers, query: Q) -> Result<Q::Result, BusError> {
        let out = self
            .dispatch(&MessageType::query::<Q>(), Box::new(query), headers)
            .await?;
        take_result::<Q::Result>(out)
    }

    /// Deliver an event to every matching consumer.
    pub async fn publish<E: DomainEvent>(&self, event: E) -> Result<(), BusError> {
        self.publish_with(Headers::new(), event).await
    }

    pub async fn publish_with<E: DomainEvent>(&self, headers: Headers, event: E) -> Result<(), BusError> {
        self.dispatch(&MessageType::event::<E>(), Box::new(event), headers)
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Erased API
    // =========================================================================

    /// Dispatch an erased message of `message_type`.
    ///
    /// Returns the declared result for commands and queries, `None` for events.
    pub async fn dispatch(
        &self,
        message_type: &MessageType,
        message: AnyMessage,
        mut headers: Headers,
    ) -> Result<Option<AnyOutput>, BusError> {
        self.enrich(message_type, &mut headers)?;

        match message_type.kind() {
            MessageKind::Command | MessageKind::Query => {
                let matched = self
                    .inner
                    .table
                    .resolve(message_type, message.as_ref(), &headers)?;
                let Match { descriptor, upcast } = matched;
                let message = upcast.unwrap_or(message);
                self.invoke(&descriptor, message, Arc::new(headers), ScopeId::new())
                    .await
            }
            MessageKind::DomainEvent => {
                self.fan_out(message_type, message, Arc::new(headers)).await?;
                Ok(None)
            }
        }
    }

    /// Invoke one descriptor in a fresh scope, as broker deliveries do.
    ///
    /// Per-scope consumers get a new instance. The descriptor's predicate is
    /// not consulted; the caller already chose it.
    pub async fn invoke_in_new_scope(
        &self,
        descriptor: &Arc<Descriptor>,
        message: AnyMessage,
        mut headers: Headers,
    ) -> Result<Option<AnyOutput>, BusError> {
        self.enrich(&descriptor.message_type, &mut headers)?;
        let scope = ScopeId::new();
        let span = info_span!(
            "scope",
            %scope,
            consumer = descriptor.consumer,
            message_type = descriptor.message_type.name(),
            correlation_id = headers.correlation_id().map(|c| c.as_str()).unwrap_or(""),
        );
        self.invoke(descriptor, message, Arc::new(headers), scope)
            .instrument(span)
            .await
    }

    async fn fan_out(
        &self,
        message_type: &MessageType,
        message: AnyMessage,
        headers: Arc<Headers>,
    ) -> Result<(), BusError> {
        let matches = self
            .inner
            .table
            .candidates(message_type, message.as_ref(), &headers);
        if matches.is_empty() {
            debug!(message_type = message_type.name(), "event has no consumers");
            return Ok(());
        }

        let attempted = matches.len();
        let mut exact_left = matches.iter().filter(|m| !m.is_derived()).count();
        let mut original = Some(message);
        let mut failures = Vec::new();

        for Match { descriptor, upcast } in matches {
            let payload = match upcast {
                Some(value) => Some(value),
                None => {
                    exact_left -= 1;
                    if exact_left == 0 {
                        original.take()
                    } else {
                        original
                            .as_deref()
                            .and_then(|m| message_type.clone_message(m))
                    }
                }
            };
            let Some(payload) = payload else {
                failures.push(BusError::handler(
                    descriptor.consumer,
                    anyhow::anyhow!("could not copy {} for delivery", message_type.name()),
                ));
                continue;
            };

            if let Err(e) = self
                .invoke(&descriptor, payload, headers.clone(), ScopeId::new())
                .await
            {
                warn!(
                    consumer = descriptor.consumer,
                    message_type = message_type.name(),
                    error = %e,
                    "event consumer failed"
                );
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::EventConsumersFailed {
                message_type: message_type.name(),
                attempted,
                failures,
            })
        }
    }

    async fn invoke(
        &self,
        descriptor: &Descriptor,
        message: AnyMessage,
        headers: Arc<Headers>,
        scope: ScopeId,
    ) -> Result<Option<AnyOutput>, BusError> {
        let Some(declared) = descriptor.declared else {
            self.run_consumer(descriptor, message, headers, scope).await?;
            return Ok(None);
        };

        let mut slot = ResultSlot::new(declared);
        let filters = &self.inner.filters;
        let query_type = descriptor.message_type.id();
        let is_query = descriptor.message_type.kind() == MessageKind::Query;
        let filtered = is_query && filters.count(query_type) > 0;

        // Post-filters need the query after the consumer has taken it.
        let retained = if filtered {
            descriptor.message_type.clone_message(message.as_ref())
        } else {
            None
        };

        let short_circuit = match &retained {
            Some(query) => filters.run_before(query_type, query.as_ref(), &headers).await?,
            None => None,
        };

        match short_circuit {
            Some(result) => {
                debug!(consumer = descriptor.consumer, "query answered by pre-filter");
                slot.set(result, "<pre-filter output>")?;
            }
            None => {
                let output = self.run_consumer(descriptor, message, headers.clone(), scope).await?;
                let mapped = self.inner.mapper.map(output, descriptor.output, declared)?;
                slot.set(mapped, descriptor.output.name)?;
            }
        }

        let replaced = match (&retained, slot.get()) {
            (Some(query), Some(result)) => {
                filters
                    .run_after(query_type, &**query, &**result, &headers)
                    .await?
            }
            _ => None,
        };
        if let Some(replacement) = replaced {
            slot.replace(replacement)?;
        }

        Ok(slot.into_inner())
    }

    async fn run_consumer(
        &self,
        descriptor: &Descriptor,
        message: AnyMessage,
        headers: Arc<Headers>,
        scope: ScopeId,
    ) -> Result<AnyOutput, BusError> {
        let consumer = descriptor.source.instance();
        let causal = headers.correlation_id().cloned();
        let ctx = ConsumeContext::new(headers, scope, descriptor.consumer);

        // AssertUnwindSafe is required because consumers are not UnwindSafe
        let outcome = AssertUnwindSafe(in_causal_chain(causal.clone(), consumer.consume_any(message, ctx)))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                error!(
                    cid = causal.as_ref().map(|c| c.as_str()).unwrap_or(""),
                    consumer = descriptor.consumer,
                    error = ?e,
                    "consumer failed"
                );
                Err(e)
            }
            Err(panic) => {
                let message = extract_panic_message(&panic);
                error!(
                    cid = causal.as_ref().map(|c| c.as_str()).unwrap_or(""),
                    consumer = descriptor.consumer,
                    panic = %message,
                    "consumer panicked"
                );
                Err(BusError::HandlerPanicked {
                    consumer: descriptor.consumer,
                    message,
                })
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("service", &self.inner.service)
            .field("descriptors", &self.inner.table.len())
            .field("enrichers", &self.inner.enrichers.len())
            .finish_non_exhaustive()
    }
}

fn take_result<R: 'static>(out: Option<AnyOutput>) -> Result<R, BusError> {
    let mismatch = |actual| BusError::ResultTypeMismatch {
        expected: type_name::<R>(),
        actual,
    };
    let out = out.ok_or_else(|| mismatch("nothing"))?;
    out.downcast::<R>()
        .map(|r| *r)
        .map_err(|_| mismatch("<erased result>"))
}

/// Extract a message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BaseType, Message};
    use crate::descriptor::Consumer;
    use crate::error::{MappingError, PipelinePhase};
    use crate::router::Routes;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // =========================================================================
    // Fixtures
    // =========================================================================

    #[derive(Debug, Clone)]
    struct Add(i64, i64);
    impl Message for Add {}
    impl Command for Add {
        type Result = i64;
    }

    struct Adder;

    #[async_trait]
    impl Consumer<Add> for Adder {
        type Output = i64;
        async fn consume(&self, cmd: Add, _ctx: ConsumeContext) -> anyhow::Result<i64> {
            Ok(cmd.0 + cmd.1)
        }
    }

    #[derive(Debug, Clone)]
    struct Explode;
    impl Message for Explode {}
    impl Command for Explode {
        type Result = ();
    }

    struct Bomb;

    #[async_trait]
    impl Consumer<Explode> for Bomb {
        type Output = ();
        async fn consume(&self, _cmd: Explode, _ctx: ConsumeContext) -> anyhow::Result<()> {
            panic!("kaboom");
        }
    }

    #[derive(Debug, Clone)]
    struct FindUser(u32);
    impl Message for FindUser {}
    impl Query for FindUser {
        type Result = UserDto;
    }

    #[derive(Debug, Clone, PartialEq)]
    struct UserRow {
        id: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct UserDto {
        label: String,
    }

    struct UserStore {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Consumer<FindUser> for UserStore {
        type Output = UserRow;
        async fn consume(&self, q: FindUser, _ctx: ConsumeContext) -> anyhow::Result<UserRow> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(UserRow { id: q.0 })
        }
    }

    struct CacheHit;

    #[async_trait]
    impl QueryFilter<FindUser> for CacheHit {
        async fn before(&self, q: &FindUser, _h: &Headers) -> anyhow::Result<Option<UserDto>> {
            Ok((q.0 == 1).then(|| UserDto {
                label: "cached".into(),
            }))
        }
    }

    struct Shout;

    #[async_trait]
    impl QueryFilter<FindUser> for Shout {
        async fn after(
            &self,
            _q: &FindUser,
            r: &UserDto,
            _h: &Headers,
        ) -> anyhow::Result<Option<UserDto>> {
            Ok(Some(UserDto {
                label: r.label.to_uppercase(),
            }))
        }
    }

    struct Deny;

    #[async_trait]
    impl QueryFilter<FindUser> for Deny {
        async fn before(&self, _q: &FindUser, _h: &Headers) -> anyhow::Result<Option<UserDto>> {
            anyhow::bail!("denied")
        }
    }

    #[derive(Debug, Clone)]
    struct Shipped {
        order: u32,
    }
    impl Message for Shipped {}
    impl DomainEvent for Shipped {}

    #[derive(Debug, Clone)]
    struct ExpressShipped {
        order: u32,
    }
    impl Message for ExpressShipped {
        fn base_types() -> Vec<BaseType> {
            vec![BaseType::of::<Shipped, Self>()]
        }
    }
    impl DomainEvent for ExpressShipped {}
    impl From<ExpressShipped> for Shipped {
        fn from(e: ExpressShipped) -> Self {
            Shipped { order: e.order }
        }
    }

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Record {
        tag: &'static str,
        journal: Journal,
        fail: bool,
    }

    #[async_trait]
    impl Consumer<Shipped> for Record {
        type Output = ();
        async fn consume(&self, e: Shipped, ctx: ConsumeContext) -> anyhow::Result<()> {
            let cid = ctx.correlation_id().map(|c| c.to_string()).unwrap_or_default();
            self.journal
                .0
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.tag, e.order, cid));
            if self.fail {
                anyhow::bail!("{} failed", self.tag);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Consumer<ExpressShipped> for Record {
        type Output = ();
        async fn consume(&self, e: ExpressShipped, _ctx: ConsumeContext) -> anyhow::Result<()> {
            self.journal
                .0
                .lock()
                .unwrap()
                .push(format!("{}:express:{}", self.tag, e.order));
            Ok(())
        }
    }

    fn record(tag: &'static str, journal: &Journal) -> Record {
        Record {
            tag,
            journal: journal.clone(),
            fail: false,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    #[tokio::test]
    async fn test_send_returns_result() {
        let dispatcher = Dispatcher::builder("test")
            .router(|r: &mut Routes| {
                r.command::<Add, _>(Adder);
            })
            .build()
            .unwrap();

        assert_eq!(dispatcher.send(Add(2, 3)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_send_unregistered_is_no_consumer() {
        let dispatcher = Dispatcher::builder("test").build().unwrap();
        let err = dispatcher.send(Add(1, 1)).await.unwrap_err();
        assert!(matches!(err, BusError::NoConsumer { .. }));
    }

    #[tokio::test]
    async fn test_panicking_consumer_is_isolated() {
        let dispatcher = Dispatcher::builder("test")
            .router(|r: &mut Routes| {
                r.command::<Explode, _>(Bomb);
                r.command::<Add, _>(Adder);
            })
            .build()
            .unwrap();

        let err = dispatcher.send(Explode).await.unwrap_err();
        match err {
            BusError::HandlerPanicked { message, .. } => assert_eq!(message, "kaboom"),
            other => panic!("unexpected error: {other}"),
        }

        // dispatcher keeps working
        assert_eq!(dispatcher.send(Add(1, 1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_predicate_excludes_sole_consumer() {
        let dispatcher = Dispatcher::builder("test")
            .router(|r: &mut Routes| {
                r.command::<Add, _>(Adder).when(|cmd, _| cmd.0 >= 0);
            })
            .build()
            .unwrap();

        assert!(dispatcher.send(Add(1, 1)).await.is_ok());
        assert!(matches!(
            dispatcher.send(Add(-1, 1)).await.unwrap_err(),
            BusError::NoConsumer { .. }
        ));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn user_dispatcher(calls: Arc<AtomicUsize>) -> DispatcherBuilder {
        Dispatcher::builder("test")
            .router(move |r: &mut Routes| {
                r.query::<FindUser, _>(UserStore {
                    calls: calls.clone(),
                });
            })
            .map(|row: UserRow| UserDto {
                label: format!("user-{}", row.id),
            })
    }

    #[tokio::test]
    async fn test_query_output_is_mapped_to_declared_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = user_dispatcher(calls.clone()).build().unwrap();

        let user = dispatcher.ask(FindUser(7)).await.unwrap();
        assert_eq!(user.label, "user-7");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_without_mapping_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::builder("test")
            .router(move |r: &mut Routes| {
                r.query::<FindUser, _>(UserStore {
                    calls: calls.clone(),
                });
            })
            .build()
            .unwrap();

        let err = dispatcher.ask(FindUser(7)).await.unwrap_err();
        assert!(matches!(err, BusError::Mapping(MappingError::NoStrategy { .. })));
    }

    #[tokio::test]
    async fn test_pre_filter_short_circuits_consumer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = user_dispatcher(calls.clone())
            .filter::<FindUser, _>(CacheHit)
            .build()
            .unwrap();

        let cached = dispatcher.ask(FindUser(1)).await.unwrap();
        assert_eq!(cached.label, "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let fresh = dispatcher.ask(FindUser(2)).await.unwrap();
        assert_eq!(fresh.label, "user-2");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_filter_replaces_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = user_dispatcher(calls)
            .filter::<FindUser, _>(Shout)
            .build()
            .unwrap();

        assert_eq!(dispatcher.ask(FindUser(3)).await.unwrap().label, "USER-3");
    }

    #[tokio::test]
    async fn test_filter_failure_skips_consumer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = user_dispatcher(calls.clone())
            .filter::<FindUser, _>(Deny)
            .build()
            .unwrap();

        let err = dispatcher.ask(FindUser(3)).await.unwrap_err();
        match err {
            BusError::Pipeline(e) => assert_eq!(e.phase, PipelinePhase::PreFilter),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[tokio::test]
    async fn test_event_reaches_exact_and_derived_in_order() {
        let journal = Journal::default();
        let j = journal.clone();
        let dispatcher = Dispatcher::builder("test")
            .router(move |r: &mut Routes| {
                r.event::<Shipped, _>(record("audit", &j)).include_derived();
                r.event::<ExpressShipped, _>(record("courier", &j));
                r.event::<Shipped, _>(record("mailer", &j));
            })
            .build()
            .unwrap();

        dispatcher
            .publish_with(Headers::correlated("c-9"), ExpressShipped { order: 4 })
            .await
            .unwrap();

        assert_eq!(journal.entries(), vec!["audit:4:c-9", "courier:express:4"]);
    }

    #[tokio::test]
    async fn test_event_failures_are_aggregated() {
        let journal = Journal::default();
        let j = journal.clone();
        let dispatcher = Dispatcher::builder("test")
            .router(move |r: &mut Routes| {
                r.event::<Shipped, _>(Record {
                    fail: true,
                    ..record("first", &j)
                });
                r.event::<Shipped, _>(record("second", &j));
                r.event::<Shipped, _>(Record {
                    fail: true,
                    ..record("third", &j)
                });
            })
            .build()
            .unwrap();

        let err = dispatcher.publish(Shipped { order: 1 }).await.unwrap_err();
        match err {
            BusError::EventConsumersFailed {
                attempted,
                failures,
                ..
            } => {
                assert_eq!(attempted, 3);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(journal.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_event_without_consumers_is_ok() {
        let dispatcher = Dispatcher::builder("test").build().unwrap();
        dispatcher.publish(Shipped { order: 1 }).await.unwrap();
    }

    // =========================================================================
    // Scopes and enrichment
    // =========================================================================

    #[tokio::test]
    async fn test_scoped_consumer_is_built_per_invocation() {
        let built = Arc::new(AtomicUsize::new(0));
        let b = built.clone();
        let dispatcher = Dispatcher::builder("test")
            .router(move |r: &mut Routes| {
                let b = b.clone();
                r.command_scoped::<Add, _, _>(move || {
                    b.fetch_add(1, Ordering::SeqCst);
                    Adder
                });
            })
            .build()
            .unwrap();

        let descriptor = dispatcher.table().descriptors().next().unwrap().clone();
        for _ in 0..3 {
            let out = dispatcher
                .invoke_in_new_scope(&descriptor, Box::new(Add(1, 2)), Headers::new())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(out.downcast_ref::<i64>(), Some(&3));
        }
        assert_eq!(built.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_consumers_see_enriched_headers() {
        struct Probe(Arc<Mutex<Option<Headers>>>);

        #[async_trait]
        impl Consumer<Add> for Probe {
            type Output = i64;
            async fn consume(&self, _cmd: Add, ctx: ConsumeContext) -> anyhow::Result<i64> {
                *self.0.lock().unwrap() = Some(ctx.headers().clone());
                Ok(0)
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let dispatcher = Dispatcher::builder("billing")
            .router(move |r: &mut Routes| {
                r.command::<Add, _>(Probe(s.clone()));
            })
            .build()
            .unwrap();

        dispatcher.send(Add(0, 0)).await.unwrap();
        let headers = seen.lock().unwrap().clone().unwrap();
        assert!(headers.correlation_id().is_some());
        assert!(headers.message_id().is_some());
        assert_eq!(headers.source(), Some("billing"));
    }

    #[tokio::test]
    async fn test_follow_up_messages_inherit_correlation() {
        struct Relay {
            dispatcher: Arc<Mutex<Option<Dispatcher>>>,
        }

        #[async_trait]
        impl Consumer<Add> for Relay {
            type Output = i64;
            async fn consume(&self, cmd: Add, _ctx: ConsumeContext) -> anyhow::Result<i64> {
                let dispatcher = self.dispatcher.lock().unwrap().clone().unwrap();
                dispatcher.publish(Shipped { order: cmd.0 as u32 }).await?;
                Ok(0)
            }
        }

        let journal = Journal::default();
        let j = journal.clone();
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let dispatcher = Dispatcher::builder("test")
            .router(move |r: &mut Routes| {
                r.command::<Add, _>(Relay {
                    dispatcher: s.clone(),
                });
                r.event::<Shipped, _>(record("log", &j));
            })
            .build()
            .unwrap();
        *slot.lock().unwrap() = Some(dispatcher.clone());

        dispatcher
            .send_with(Headers::correlated("root"), Add(8, 0))
            .await
            .unwrap();
        assert_eq!(journal.entries(), vec!["log:8:root"]);
    }

    #[tokio::test]
    async fn test_cleared_enrichers_leave_headers_alone() {
        let dispatcher = Dispatcher::builder("test").clear_enrichers().build().unwrap();
        let mut headers = Headers::new();
        dispatcher
            .enrich(&MessageType::command::<Add>(), &mut headers)
            .unwrap();
        assert_eq!(headers, Headers::new());
    }
}
