//! Typed route registration.
//!
//! Each service implements [`Router`] and registers its consumers on the
//! [`Routes`] it is handed. There is no scanning; what a router registers is
//! exactly what the dispatch table contains.
//!
//! ```ignore
//! struct CalcRouter;
//!
//! impl Router for CalcRouter {
//!     fn routes(&self, routes: &mut Routes) {
//!         routes
//!             .command::<CalculateRange, _>(RangeCalculator)
//!             .via(RouteMetadata::rpc("main", "calc"));
//!
//!         routes
//!             .event::<OrderEvent, _>(AuditTrail::default())
//!             .include_derived()
//!             .when(|e, _| e.amount > 0);
//!     }
//! }
//! ```

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::{Command, DomainEvent, Message, MessageType, Query};
use crate::descriptor::{
    AnyConsumer, Consumer, ConsumerSource, ConsumerWrapper, Descriptor, RouteMetadata, TypeInfo,
};
use crate::headers::Headers;
use crate::serializer::TypedCodec;

/// Registers one service's consumers.
pub trait Router: Send + Sync {
    fn routes(&self, routes: &mut Routes);
}

impl<F> Router for F
where
    F: Fn(&mut Routes) + Send + Sync,
{
    fn routes(&self, routes: &mut Routes) {
        self(routes)
    }
}

/// Collects descriptors from every router, in registration order.
pub struct Routes {
    router: &'static str,
    descriptors: Vec<Descriptor>,
}

impl Routes {
    pub(crate) fn new() -> Self {
        Self {
            router: "<unnamed>",
            descriptors: Vec::new(),
        }
    }

    pub(crate) fn collect<R: Router>(&mut self, router: &R) {
        self.router = type_name::<R>();
        router.routes(self);
    }

    pub(crate) fn into_descriptors(self) -> Vec<Descriptor> {
        self.descriptors
    }

    /// Route a command to a shared consumer.
    pub fn command<C, H>(&mut self, consumer: H) -> RouteHandle<'_, C, C::Result>
    where
        C: Command,
        H: Consumer<C>,
    {
        self.push(
            MessageType::command::<C>(),
            Some(TypeInfo::of::<C::Result>()),
            Some(C::namespace()),
            TypeInfo::of::<H::Output>(),
            type_name::<H>(),
            shared::<C, H>(consumer),
        )
    }

    /// Route a command to a fresh consumer per scope.
    pub fn command_scoped<C, H, F>(&mut self, factory: F) -> RouteHandle<'_, C, C::Result>
    where
        C: Command,
        H: Consumer<C>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.push(
            MessageType::command::<C>(),
            Some(TypeInfo::of::<C::Result>()),
            Some(C::namespace()),
            TypeInfo::of::<H::Output>(),
            type_name::<H>(),
            scoped::<C, H, F>(factory),
        )
    }

    /// Route a query to a shared consumer.
    pub fn query<Q, H>(&mut self, consumer: H) -> RouteHandle<'_, Q, Q::Result>
    where
        Q: Query,
        H: Consumer<Q>,
    {
        self.push(
            MessageType::query::<Q>(),
            Some(TypeInfo::of::<Q::Result>()),
            Some(Q::namespace()),
            TypeInfo::of::<H::Output>(),
            type_name::<H>(),
            shared::<Q, H>(consumer),
        )
    }

    /// Route a query to a fresh consumer per scope.
    pub fn query_scoped<Q, H, F>(&mut self, factory: F) -> RouteHandle<'_, Q, Q::Result>
    where
        Q: Query,
        H: Consumer<Q>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.push(
            MessageType::query::<Q>(),
            Some(TypeInfo::of::<Q::Result>()),
            Some(Q::namespace()),
            TypeInfo::of::<H::Output>(),
            type_name::<H>(),
            scoped::<Q, H, F>(factory),
        )
    }

    /// Subscribe a consumer to a domain event.
    pub fn event<E, H>(&mut self, consumer: H) -> RouteHandle<'_, E, ()>
    where
        E: DomainEvent,
        H: Consumer<E, Output = ()>,
    {
        self.push(
            MessageType::event::<E>(),
            None,
            None,
            TypeInfo::of::<()>(),
            type_name::<H>(),
            shared::<E, H>(consumer),
        )
    }

    /// Subscribe a fresh consumer per scope to a domain event.
    pub fn event_scoped<E, H, F>(&mut self, factory: F) -> RouteHandle<'_, E, ()>
    where
        E: DomainEvent,
        H: Consumer<E, Output = ()>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.push(
            MessageType::event::<E>(),
            None,
            None,
            TypeInfo::of::<()>(),
            type_name::<H>(),
            scoped::<E, H, F>(factory),
        )
    }

    fn push<M, R>(
        &mut self,
        message_type: MessageType,
        declared: Option<TypeInfo>,
        namespace: Option<&'static str>,
        output: TypeInfo,
        consumer: &'static str,
        source: ConsumerSource,
    ) -> RouteHandle<'_, M, R> {
        let seq = self.descriptors.len();
        self.descriptors.push(Descriptor {
            seq,
            message_type,
            consumer,
            router: self.router,
            source,
            output,
            declared,
            namespace,
            predicate: None,
            include_derived: false,
            route: None,
            codec: None,
        });
        RouteHandle {
            descriptor: &mut self.descriptors[seq],
            _types: PhantomData,
        }
    }
}

fn shared<M: Message, H: Consumer<M>>(consumer: H) -> ConsumerSource {
    ConsumerSource::Shared(Arc::new(ConsumerWrapper::<H, M>::new(consumer)))
}

fn scoped<M, H, F>(factory: F) -> ConsumerSource
where
    M: Message,
    H: Consumer<M>,
    F: Fn() -> H + Send + Sync + 'static,
{
    ConsumerSource::PerScope(Arc::new(move || {
        Arc::new(ConsumerWrapper::<H, M>::new(factory())) as Arc<dyn AnyConsumer>
    }))
}

/// Refines the descriptor just registered.
pub struct RouteHandle<'a, M, R> {
    descriptor: &'a mut Descriptor,
    _types: PhantomData<fn() -> (M, R)>,
}

impl<'a, M: Message, R> RouteHandle<'a, M, R> {
    /// Only match messages for which `predicate` holds.
    pub fn when<F>(self, predicate: F) -> Self
    where
        F: Fn(&M, &Headers) -> bool + Send + Sync + 'static,
    {
        self.descriptor.predicate = Some(Arc::new(move |message, headers| {
            message
                .downcast_ref::<M>()
                .is_some_and(|m| predicate(m, headers))
        }));
        self
    }

    /// Also match every message type that declares `M` as a base type.
    pub fn include_derived(self) -> Self {
        self.descriptor.include_derived = true;
        self
    }
}

impl<'a, M, R> RouteHandle<'a, M, R>
where
    M: Message + DeserializeOwned,
    R: Serialize + 'static,
{
    /// Bind the route to a broker entity.
    pub fn via(self, route: RouteMetadata) -> Self {
        self.descriptor.route = Some(route);
        self.descriptor.codec = Some(Arc::new(TypedCodec::<M, R>::new()));
        self
    }
}
