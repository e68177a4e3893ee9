//! # Switchyard NATS
//!
//! NATS transport for switchyard buses.
//!
//! ```text
//! ConnectionManager ── NatsConnector ──▶ NatsLink (client + subscription pumps)
//!                                              │
//! BusDriver ── NatsStrategyFactory ────────────┘
//!                create:    JetStream stream for durable entities
//!                subscribe: queue group per competing entity, plain otherwise
//!                publish:   subject = entity destination, headers mapped 1:1
//! ```
//!
//! The client reconnects on its own. Connect and disconnect events are
//! reported to the connection manager, which makes the driver re-create and
//! re-subscribe its entities.
//!
//! ## Example
//!
//! ```ignore
//! let manager = Arc::new(ConnectionManager::new());
//! manager
//!     .connect(&NatsConnector::with_name("calc-service"), &BusSettings::new("main", ["nats://localhost:4222"]))
//!     .await?;
//!
//! let entities = plan_entities(&dispatcher, "main", &NatsStrategyFactory, &replies)?;
//! let driver = BusDriver::builder("main", manager.clone(), dispatcher)
//!     .entities(entities)
//!     .build();
//! driver.start().await?;
//! ```

mod connector;
mod headers;
mod strategies;

pub use connector::{NatsConnector, NatsLink};
pub use headers::{from_header_map, into_delivery, to_header_map};
pub use strategies::{stream_name, NatsQueueSender, NatsStrategyFactory};
