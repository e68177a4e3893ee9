//! Structured error types for switchyard.
//!
//! [`BusError`] is the pattern-matchable error every public operation returns.
//! Consumers, filters, enrichers and strategies are written against
//! `anyhow::Result`; the core wraps their failures into typed variants that
//! name the failing component.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` crosses a broker boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for consumers)
//! - [`BusError::kind`] plus the display string is what an RPC responder sends
//!   back, and the caller reconstructs it as [`RpcError::Remote`]
//!
//! # Example
//!
//! ```ignore
//! match dispatcher.send(CalculateRange { values }).await {
//!     Ok(range) => println!("{range:?}"),
//!     Err(BusError::NoConsumer { message_type }) => eprintln!("nobody handles {message_type}"),
//!     Err(BusError::Rpc(RpcError::Timeout { timeout })) => eprintln!("gave up after {timeout:?}"),
//!     Err(e) => eprintln!("{e}"),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::MessageKind;
use crate::headers::CorrelationId;

// =============================================================================
// Bus Error
// =============================================================================

/// Top-level error for dispatch, broker and RPC operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No consumer is registered for a command or query.
    #[error("no consumer registered for {message_type}")]
    NoConsumer {
        /// Human-readable type name.
        message_type: &'static str,
    },

    /// A command or query resolved to more than one consumer.
    #[error("multiple consumers registered for {message_type}: {}", consumers.join(", "))]
    DuplicateConsumer {
        /// Human-readable type name.
        message_type: &'static str,
        /// Every consumer that matched.
        consumers: Vec<&'static str>,
    },

    /// One message type was registered under two different kinds.
    #[error("{message_type} registered as both {first} and {second}")]
    KindConflict {
        /// Human-readable type name.
        message_type: &'static str,
        /// Kind of the first registration.
        first: MessageKind,
        /// Kind of the conflicting registration.
        second: MessageKind,
    },

    /// A consumer returned an error.
    #[error("consumer {consumer} failed: {source}")]
    Handler {
        /// Consumer type name.
        consumer: &'static str,
        /// The consumer's error.
        #[source]
        source: anyhow::Error,
    },

    /// A consumer panicked. The dispatcher keeps running.
    #[error("consumer {consumer} panicked: {message}")]
    HandlerPanicked {
        /// Consumer type name.
        consumer: &'static str,
        /// Extracted panic payload.
        message: String,
    },

    /// A value of the wrong runtime type was written to a result slot.
    #[error("result type mismatch: expected {expected}, got {actual}")]
    ResultTypeMismatch {
        /// Declared result type.
        expected: &'static str,
        /// Type that was offered.
        actual: &'static str,
    },

    /// A result slot was written twice.
    #[error("result for {result_type} already set")]
    ResultAlreadySet {
        /// Declared result type.
        result_type: &'static str,
    },

    /// The message has no broker route or codec.
    #[error("{message_type} is not wired to a broker route")]
    NotWired {
        /// Human-readable type name.
        message_type: &'static str,
    },

    /// Enricher or filter failures.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Result mapping failed.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Encoding or decoding failed.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A broker entity operation failed.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// An RPC exchange failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A reply-to address could not be parsed.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// One or more event consumers failed. The rest still ran.
    #[error("{} of {attempted} consumers failed for {message_type}", failures.len())]
    EventConsumersFailed {
        /// Human-readable type name.
        message_type: &'static str,
        /// How many consumers were invoked.
        attempted: usize,
        /// Every failure, in registration order.
        failures: Vec<BusError>,
    },
}

impl BusError {
    /// Wrap a consumer error.
    pub fn handler(consumer: &'static str, source: anyhow::Error) -> Self {
        BusError::Handler { consumer, source }
    }

    /// Stable snake_case name of the variant, used as the remote error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::NoConsumer { .. } => "no_consumer",
            BusError::DuplicateConsumer { .. } => "duplicate_consumer",
            BusError::KindConflict { .. } => "kind_conflict",
            BusError::Handler { .. } => "handler_failed",
            BusError::HandlerPanicked { .. } => "handler_panicked",
            BusError::ResultTypeMismatch { .. } => "result_type_mismatch",
            BusError::ResultAlreadySet { .. } => "result_already_set",
            BusError::NotWired { .. } => "not_wired",
            BusError::Pipeline(_) => "pipeline_failed",
            BusError::Mapping(_) => "mapping_failed",
            BusError::Serialization(_) => "serialization_failed",
            BusError::Entity(_) => "entity_failed",
            BusError::Rpc(_) => "rpc_failed",
            BusError::Address(_) => "invalid_address",
            BusError::EventConsumersFailed { .. } => "event_consumers_failed",
        }
    }
}

// =============================================================================
// Pipeline Errors
// =============================================================================

/// Which pipeline stage produced a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Header enrichment.
    Enrich,
    /// Query pre-filters.
    PreFilter,
    /// Query post-filters.
    PostFilter,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelinePhase::Enrich => write!(f, "enrich"),
            PipelinePhase::PreFilter => write!(f, "pre-filter"),
            PipelinePhase::PostFilter => write!(f, "post-filter"),
        }
    }
}

/// A single failing pipeline component.
#[derive(Debug)]
pub struct ComponentFailure {
    /// Enricher or filter name.
    pub component: String,
    /// The component's error.
    pub source: anyhow::Error,
}

impl fmt::Display for ComponentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.component, self.source)
    }
}

/// Aggregate of every component that failed in one pipeline phase.
#[derive(Debug, Error)]
#[error("{phase} pipeline failed: {}", render_failures(failures))]
pub struct PipelineError {
    /// Phase that failed.
    pub phase: PipelinePhase,
    /// Failures in registration order.
    pub failures: Vec<ComponentFailure>,
}

impl PipelineError {
    /// Names of the failing components, in registration order.
    pub fn components(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.component.as_str()).collect()
    }
}

fn render_failures(failures: &[ComponentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result mapping failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// No mapping is registered for the pair.
    #[error("no mapping strategy from {from} to {to}")]
    NoStrategy {
        /// Source type name.
        from: &'static str,
        /// Target type name.
        to: &'static str,
    },

    /// More than one mapping is registered for the pair.
    #[error("multiple mapping strategies from {from} to {to}")]
    MultipleStrategies {
        /// Source type name.
        from: &'static str,
        /// Target type name.
        to: &'static str,
    },
}

// =============================================================================
// Serialization Errors
// =============================================================================

/// Encoding, decoding or content-type negotiation failed.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// No serializer is registered for the requested content type.
    #[error("unsupported content type {content_type}")]
    UnsupportedContentType {
        /// The requested content type.
        content_type: String,
    },

    /// The value could not be encoded.
    #[error("failed to encode as {content_type}: {source}")]
    Encode {
        /// Content type used.
        content_type: String,
        /// Underlying codec error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The bytes could not be decoded.
    #[error("failed to decode {content_type}: {source}")]
    Decode {
        /// Content type used.
        content_type: String,
        /// Underlying codec error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

// =============================================================================
// Entity Errors
// =============================================================================

/// A broker entity lifecycle operation failed.
#[derive(Debug, Error)]
pub enum EntityError {
    /// The creation strategy failed.
    #[error("failed to create {entity} on bus {bus}: {source}")]
    CreationFailed {
        /// Bus name.
        bus: String,
        /// Entity name.
        entity: String,
        /// Strategy error.
        #[source]
        source: anyhow::Error,
    },

    /// The subscription strategy failed.
    #[error("failed to subscribe {entity} on bus {bus}: {source}")]
    SubscriptionFailed {
        /// Bus name.
        bus: String,
        /// Entity name.
        entity: String,
        /// Strategy error.
        #[source]
        source: anyhow::Error,
    },

    /// The publish strategy failed.
    #[error("failed to publish to {entity} on bus {bus}: {source}")]
    PublishFailed {
        /// Bus name.
        bus: String,
        /// Entity name.
        entity: String,
        /// Strategy error.
        #[source]
        source: anyhow::Error,
    },

    /// The dispose strategy failed.
    #[error("failed to dispose {entity} on bus {bus}: {source}")]
    DisposeFailed {
        /// Bus name.
        bus: String,
        /// Entity name.
        entity: String,
        /// Strategy error.
        #[source]
        source: anyhow::Error,
    },

    /// The connector could not establish a transport.
    #[error("failed to connect bus {bus}: {source}")]
    ConnectFailed {
        /// Bus name.
        bus: String,
        /// Connector error.
        #[source]
        source: anyhow::Error,
    },

    /// The bus has no live transport.
    #[error("bus {bus} is not connected")]
    NotConnected {
        /// Bus name.
        bus: String,
    },

    /// No driver or reply sender is registered for the bus.
    #[error("unknown bus {bus}")]
    UnknownBus {
        /// Bus name.
        bus: String,
    },

    /// No entity on the bus accepted the message.
    #[error("no entity on bus {bus} publishes {message_type}")]
    NoPublisher {
        /// Bus name.
        bus: String,
        /// Human-readable type name.
        message_type: &'static str,
    },

    /// One or more buses failed to start.
    #[error("failed to start buses: {}", buses.join(", "))]
    StartupFailed {
        /// Names of the buses that failed.
        buses: Vec<String>,
    },
}

// =============================================================================
// RPC Errors
// =============================================================================

/// An RPC exchange failed.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A request reached a responder without a required header.
    #[error("rpc request is missing {field}")]
    MissingMetadata {
        /// Header name.
        field: &'static str,
    },

    /// No reply arrived before the deadline.
    #[error("rpc timed out after {timeout:?}")]
    Timeout {
        /// How long we waited.
        timeout: Duration,
    },

    /// The remote consumer failed.
    #[error("remote {kind}: {message}")]
    Remote {
        /// Remote error kind, see [`BusError::kind`].
        kind: String,
        /// Remote error message.
        message: String,
    },

    /// The pending request was dropped before a reply arrived.
    #[error("rpc canceled")]
    Canceled,

    /// The correlation id is already awaiting a reply.
    #[error("correlation id {correlation_id} is already pending")]
    DuplicateCorrelation {
        /// The conflicting id.
        correlation_id: CorrelationId,
    },

    /// The responder has no consumer for the namespace.
    #[error("no rpc consumer for namespace {namespace}")]
    UnknownNamespace {
        /// Requested namespace.
        namespace: String,
    },

    /// The request could not be published.
    #[error("failed to publish rpc request: {0}")]
    Publish(#[source] Box<BusError>),
}

// =============================================================================
// Address Errors
// =============================================================================

/// A reply-to address was malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reply address {input:?}: {reason}")]
pub struct AddressError {
    /// The raw input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_consumer_display() {
        let err = BusError::DuplicateConsumer {
            message_type: "CalculateRange",
            consumers: vec!["RangeA", "RangeB"],
        };
        let text = err.to_string();
        assert!(text.contains("multiple consumers"));
        assert!(text.contains("RangeA, RangeB"));
    }

    #[test]
    fn test_no_consumer_display() {
        let err = BusError::NoConsumer {
            message_type: "GetUser",
        };
        assert!(err.to_string().contains("no consumer registered"));
        assert_eq!(err.kind(), "no_consumer");
    }

    #[test]
    fn test_pipeline_error_lists_components() {
        let err = PipelineError {
            phase: PipelinePhase::Enrich,
            failures: vec![
                ComponentFailure {
                    component: "tenant".into(),
                    source: anyhow::anyhow!("missing tenant"),
                },
                ComponentFailure {
                    component: "locale".into(),
                    source: anyhow::anyhow!("bad locale"),
                },
            ],
        };
        assert_eq!(err.components(), vec!["tenant", "locale"]);
        let text = err.to_string();
        assert!(text.starts_with("enrich pipeline failed"));
        assert!(text.contains("tenant: missing tenant"));
        assert!(text.contains("locale: bad locale"));
    }

    #[test]
    fn test_rpc_errors_are_distinguishable() {
        let timeout = BusError::from(RpcError::Timeout {
            timeout: Duration::from_millis(50),
        });
        let remote = BusError::from(RpcError::Remote {
            kind: "handler_failed".into(),
            message: "boom".into(),
        });

        assert!(matches!(timeout, BusError::Rpc(RpcError::Timeout { .. })));
        assert!(matches!(remote, BusError::Rpc(RpcError::Remote { .. })));
        assert!(timeout.to_string().contains("timed out"));
        assert!(remote.to_string().contains("boom"));
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let err = BusError::handler("RangeHandler", anyhow::anyhow!("empty input"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("empty input"));
    }

    #[test]
    fn test_event_failures_display_counts() {
        let err = BusError::EventConsumersFailed {
            message_type: "OrderShipped",
            attempted: 3,
            failures: vec![BusError::handler("Mailer", anyhow::anyhow!("smtp down"))],
        };
        assert_eq!(err.to_string(), "1 of 3 consumers failed for OrderShipped");
    }
}
