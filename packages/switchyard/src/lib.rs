//! # Switchyard
//!
//! Routing and correlation core for services that talk over message brokers.
//!
//! ## Core Concepts
//!
//! - [`Command`]: a request for work with exactly one consumer
//! - [`Query`]: a read with exactly one consumer and a filter pipeline around it
//! - [`DomainEvent`]: a fact delivered to every matching consumer
//!
//! Consumers are registered by [`Router`]s into an immutable [`DispatchTable`].
//! The [`Dispatcher`] resolves a message to its consumers, runs the enricher
//! and filter pipelines around the call, and maps results to the declared type.
//!
//! ## Architecture
//!
//! ```text
//! Router::routes() ──▶ DispatchTable (immutable)
//!                           │
//!   send/ask/publish        ▼
//!   ─────────────────▶ Dispatcher ─▶ enrichers ─▶ pre-filters ─▶ consumer
//!                           ▲                                    │
//!                           │                      post-filters ◀┘
//!                           │
//! broker ─▶ BusEntity sink ─┘   (DescriptorReceiver / RpcResponder)
//!              ▲
//!   BusDriver: create ─▶ subscribe ─▶ publish ─▶ dispose
//!              ▲
//!   ConnectionManager ── Reconnected ──▶ re-create, re-subscribe
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One consumer per command or query** - enforced when the table is built
//! 2. **Headers are set once** - re-setting a present header is a no-op unless forced
//! 3. **Consumers are isolated** - a failing or panicking consumer never takes
//!    the dispatcher down
//! 4. **Replies match once** - a pending RPC call is removed by whoever resolves it
//!
//! ## Guarantees
//!
//! - Events fan out in registration order; every consumer runs even when
//!   earlier ones fail
//! - An RPC call waits at most its timeout; late replies are discarded
//! - Publishing while a bus is down fails fast with `NotConnected`
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{Command, ConsumeContext, Consumer, Dispatcher, Message, Routes};
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct CalculateRange { values: Vec<i64> }
//! impl Message for CalculateRange {}
//! impl Command for CalculateRange { type Result = (i64, i64); }
//!
//! struct RangeCalculator;
//!
//! #[async_trait::async_trait]
//! impl Consumer<CalculateRange> for RangeCalculator {
//!     type Output = (i64, i64);
//!     async fn consume(&self, cmd: CalculateRange, _: ConsumeContext) -> anyhow::Result<(i64, i64)> {
//!         let min = cmd.values.iter().copied().min().unwrap_or_default();
//!         let max = cmd.values.iter().copied().max().unwrap_or_default();
//!         Ok((min, max))
//!     }
//! }
//!
//! let dispatcher = Dispatcher::builder("calc")
//!     .router(|r: &mut Routes| {
//!         r.command::<CalculateRange, _>(RangeCalculator);
//!     })
//!     .build()?;
//!
//! let (min, max) = dispatcher.send(CalculateRange { values: vec![3, 9, 1, 7] }).await?;
//! ```

// Message model
mod address;
mod core;
mod headers;
mod serializer;
mod transport;

// Dispatch
mod descriptor;
mod dispatch;
mod enrich;
mod filter;
mod mapping;
mod router;
mod table;

// Broker lifecycle
mod connection;
mod driver;
mod entity;
mod inbound;
mod plan;

mod error;

// Request/response over queues
pub mod rpc;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export message model
pub use crate::address::ReplyAddress;
pub use crate::core::{
    AnyMessage, AnyOutput, BaseType, Command, DomainEvent, Message, MessageKind, MessageType, Query, Upcast,
};
pub use crate::headers::{CorrelationId, Headers, MessageId};
pub use crate::serializer::{
    decode, encode, DeserializeVisitor, JsonSerializer, Serializer, SerializerRegistry, TypedCodec, WireCodec, JSON,
};
pub use crate::transport::{header, Delivery, Outbound, QueueSender, ReplySender};

// Re-export dispatch types
pub use crate::descriptor::{ConsumeContext, Consumer, Descriptor, RouteMetadata, ScopeId, TypeInfo};
pub use crate::dispatch::{Dispatcher, DispatcherBuilder};
pub use crate::enrich::{
    causal_correlation_id, CorrelationIdEnricher, EnrichContext, Enricher, EnricherPipeline, MessageIdEnricher,
    SourceServiceEnricher, TimestampEnricher,
};
pub use crate::filter::{QueryFilter, QueryFilters};
pub use crate::mapping::{ResultMapper, ResultSlot};
pub use crate::router::{RouteHandle, Router, Routes};
pub use crate::table::{DispatchTable, DispatchTableBuilder, Match, Matches};

// Re-export broker lifecycle types
pub use crate::connection::{
    BusSettings, Connection, ConnectionEvent, ConnectionManager, ConnectionSignals, ConnectionState, Connector,
    Credentials, RpcSettings, DEFAULT_HEARTBEAT, DEFAULT_RETRY_INTERVAL, DEFAULT_RPC_TIMEOUT,
};
pub use crate::driver::{
    start_buses, BusDriver, BusDriverBuilder, BusLifecycle, ReplyRouter, StartupReport, TransportReplySender,
};
pub use crate::entity::{
    route_key_matches, BusEntity, CreationStrategy, DisposeStrategy, EntityInfo, EntityKind, EntityOptions,
    InboundSink, PublishStrategy, Strategies, StrategyFactory, SubscriptionStrategy,
};
pub use crate::inbound::DescriptorReceiver;
pub use crate::plan::plan_entities;

// Re-export error types
pub use crate::error::{
    AddressError, BusError, ComponentFailure, EntityError, MappingError, PipelineError, PipelinePhase, RpcError,
    SerializationError,
};

// Re-export RPC types
pub use crate::rpc::{PendingGuard, PendingRequests, RemoteError, ReplyQueue, RpcClient, RpcResponder};

// Re-export commonly used external types
pub use async_trait::async_trait;
