//! Core message traits for switchyard.
//!
//! # Overview
//!
//! Switchyard routes three kinds of messages:
//! - [`Command`] = Intent with exactly one consumer and a declared result
//! - [`Query`] = Question with exactly one consumer and a declared result
//! - [`DomainEvent`] = Fact with any number of consumers and no result
//!
//! Every kind implements [`Message`], which carries the only piece of
//! "hierarchy" switchyard knows about: the list of [`BaseType`]s a message
//! can be upcast into. Consumers registered against a base type with
//! `include_derived` receive the upcast value.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct CalculateRange { values: Vec<i64> }
//!
//! impl Message for CalculateRange {}
//!
//! impl Command for CalculateRange {
//!     type Result = Range;
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Type-erased message payload as it moves through the dispatcher.
pub type AnyMessage = Box<dyn Any + Send + Sync>;

/// Type-erased consumer output or query result.
pub type AnyOutput = Box<dyn Any + Send + Sync>;

/// Conversion from a concrete message into one of its base types.
pub type Upcast = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<AnyMessage> + Send + Sync>;

/// The three message kinds switchyard routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Intent. Exactly one consumer, declared result.
    Command,
    /// Question. Exactly one consumer, declared result, filter pipeline.
    Query,
    /// Fact. Any number of consumers, no result.
    DomainEvent,
}

impl MessageKind {
    /// Returns true for kinds that require exactly one consumer.
    pub fn is_single_consumer(&self) -> bool {
        matches!(self, MessageKind::Command | MessageKind::Query)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
            MessageKind::DomainEvent => write!(f, "domain event"),
        }
    }
}

/// Base trait for anything switchyard can route.
pub trait Message: Any + Send + Sync + 'static {
    /// Base types this message can be delivered as.
    ///
    /// Consumers registered for one of these types with `include_derived`
    /// receive the upcast value. Bases may list their own bases; the
    /// dispatch table follows the chain transitively.
    fn base_types() -> Vec<BaseType>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// A request for work with exactly one consumer.
pub trait Command: Message {
    /// Declared result type. Use `()` for void commands.
    type Result: Send + Sync + 'static;

    /// Namespace used to multiplex several command types onto one RPC queue.
    fn namespace() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// A read with exactly one consumer and a filter pipeline around it.
pub trait Query: Message + Clone {
    /// Declared result type.
    type Result: Send + Sync + 'static;

    /// Namespace used to multiplex several query types onto one RPC queue.
    fn namespace() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// A fact delivered to every matching consumer.
pub trait DomainEvent: Message + Clone {}

/// Erased clone used when one event fans out to several consumers.
pub(crate) type CloneFn = fn(&(dyn Any + Send + Sync)) -> Option<AnyMessage>;

fn clone_erased<T: Clone + Send + Sync + 'static>(
    value: &(dyn Any + Send + Sync),
) -> Option<AnyMessage> {
    value
        .downcast_ref::<T>()
        .map(|v| Box::new(v.clone()) as AnyMessage)
}

/// Runtime identity of a routable message type.
///
/// Built once per registration or dispatch via [`MessageType::command`],
/// [`MessageType::query`] or [`MessageType::event`]. Equality is by `TypeId`.
#[derive(Clone)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
    kind: MessageKind,
    bases: fn() -> Vec<BaseType>,
    cloner: Option<CloneFn>,
}

impl MessageType {
    /// Identity for a command type.
    pub fn command<C: Command>() -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: std::any::type_name::<C>(),
            kind: MessageKind::Command,
            bases: C::base_types,
            cloner: None,
        }
    }

    /// Identity for a query type.
    pub fn query<Q: Query>() -> Self {
        Self {
            id: TypeId::of::<Q>(),
            name: std::any::type_name::<Q>(),
            kind: MessageKind::Query,
            bases: Q::base_types,
            cloner: Some(clone_erased::<Q>),
        }
    }

    /// Identity for a domain event type.
    pub fn event<E: DomainEvent>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
            kind: MessageKind::DomainEvent,
            bases: E::base_types,
            cloner: Some(clone_erased::<E>),
        }
    }

    /// The `TypeId` of the concrete message type.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The Rust type name of the message.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Direct base types declared by the message.
    pub fn bases(&self) -> Vec<BaseType> {
        (self.bases)()
    }

    pub(crate) fn clone_message(&self, value: &(dyn Any + Send + Sync)) -> Option<AnyMessage> {
        self.cloner.and_then(|clone| clone(value))
    }

    /// Every base type reachable from this type, with a composed upcast
    /// from this type into each of them.
    ///
    /// Cycles and diamonds are tolerated: each base appears once, reached
    /// through the first path found.
    pub fn ancestors(&self) -> Vec<(TypeId, &'static str, Upcast)> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(self.id);

        let mut stack: Vec<(BaseType, Option<Upcast>)> =
            self.bases().into_iter().rev().map(|b| (b, None)).collect();

        while let Some((base, via)) = stack.pop() {
            if !seen.insert(base.id) {
                continue;
            }
            let upcast = match via {
                None => base.upcast.clone(),
                Some(prefix) => compose(prefix, base.upcast.clone()),
            };
            for parent in (base.bases)().into_iter().rev() {
                stack.push((parent, Some(upcast.clone())));
            }
            out.push((base.id, base.name, upcast));
        }
        out
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

fn compose(first: Upcast, second: Upcast) -> Upcast {
    Arc::new(move |value| {
        let intermediate = first(value)?;
        second(intermediate.as_ref())
    })
}

/// A supertype a message can be delivered as.
///
/// Rust has no inheritance, so "derived from" is expressed as a conversion:
/// `M` derives from `B` when `B: From<M>`.
///
/// ```ignore
/// #[derive(Clone)]
/// struct OrderEvent { order_id: Uuid }
/// impl Message for OrderEvent {}
/// impl DomainEvent for OrderEvent {}
///
/// #[derive(Clone)]
/// struct OrderShipped { order_id: Uuid, carrier: String }
/// impl Message for OrderShipped {
///     fn base_types() -> Vec<BaseType> {
///         vec![BaseType::of::<OrderEvent, Self>()]
///     }
/// }
/// impl From<OrderShipped> for OrderEvent { ... }
/// ```
#[derive(Clone)]
pub struct BaseType {
    id: TypeId,
    name: &'static str,
    bases: fn() -> Vec<BaseType>,
    upcast: Upcast,
}

impl BaseType {
    /// Declare `B` as a base of `M`.
    pub fn of<B, M>() -> Self
    where
        B: Message + From<M>,
        M: Message + Clone,
    {
        Self {
            id: TypeId::of::<B>(),
            name: std::any::type_name::<B>(),
            bases: B::base_types,
            upcast: Arc::new(|value| {
                value
                    .downcast_ref::<M>()
                    .map(|m| Box::new(B::from(m.clone())) as AnyMessage)
            }),
        }
    }

    /// The `TypeId` of the base type.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The Rust type name of the base type.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseType")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
