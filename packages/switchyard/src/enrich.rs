//! Header enrichment.
//!
//! Enrichers run in registration order right before a message is dispatched
//! locally and right before it is handed to a broker. Each one only fills
//! fields that are still empty, so enriching twice is the same as enriching
//! once.
//!
//! # Causal chain
//!
//! While a consumer runs, its message's correlation id is installed as the
//! task's *causal* id. Anything that consumer sends picks it up through
//! [`CorrelationIdEnricher`], without the consumer threading headers by hand.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;

use crate::core::MessageType;
use crate::error::{ComponentFailure, PipelineError, PipelinePhase};
use crate::headers::{CorrelationId, Headers, MessageId};

tokio::task_local! {
    static CAUSAL: CorrelationId;
}

/// Correlation id of the consumer currently running on this task, if any.
pub fn causal_correlation_id() -> Option<CorrelationId> {
    CAUSAL.try_with(|id| id.clone()).ok()
}

/// Run `fut` with `id` as the causal correlation id.
pub(crate) async fn in_causal_chain<F: Future>(id: Option<CorrelationId>, fut: F) -> F::Output {
    match id {
        Some(id) => CAUSAL.scope(id, fut).await,
        None => fut.await,
    }
}

/// What an enricher knows about the message besides its headers.
pub struct EnrichContext<'a> {
    pub message_type: &'a MessageType,
    /// Name of this service.
    pub service: &'a str,
    /// Correlation id of the message that caused this one.
    pub causal: Option<CorrelationId>,
}

impl<'a> EnrichContext<'a> {
    pub fn new(message_type: &'a MessageType, service: &'a str) -> Self {
        Self {
            message_type,
            service,
            causal: causal_correlation_id(),
        }
    }
}

/// A set-once-if-absent header mutator.
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn enrich(&self, headers: &mut Headers, ctx: &EnrichContext<'_>) -> anyhow::Result<()>;
}

/// Reuses the causal correlation id, or mints a new one.
#[derive(Debug, Default)]
pub struct CorrelationIdEnricher;

impl Enricher for CorrelationIdEnricher {
    fn enrich(&self, headers: &mut Headers, ctx: &EnrichContext<'_>) -> anyhow::Result<()> {
        if headers.correlation_id().is_none() {
            headers.set_correlation_id(ctx.causal.clone().unwrap_or_default());
        }
        Ok(())
    }
}

/// Gives every message a unique id.
#[derive(Debug, Default)]
pub struct MessageIdEnricher;

impl Enricher for MessageIdEnricher {
    fn enrich(&self, headers: &mut Headers, _ctx: &EnrichContext<'_>) -> anyhow::Result<()> {
        if headers.message_id().is_none() {
            headers.set_message_id(MessageId::new());
        }
        Ok(())
    }
}

/// Stamps the publishing service.
#[derive(Debug, Default)]
pub struct SourceServiceEnricher;

impl Enricher for SourceServiceEnricher {
    fn enrich(&self, headers: &mut Headers, ctx: &EnrichContext<'_>) -> anyhow::Result<()> {
        headers.set_source(ctx.service);
        Ok(())
    }
}

/// Stamps `occurred_at`.
#[derive(Debug, Default)]
pub struct TimestampEnricher;

impl Enricher for TimestampEnricher {
    fn enrich(&self, headers: &mut Headers, _ctx: &EnrichContext<'_>) -> anyhow::Result<()> {
        headers.set_occurred_at(Utc::now());
        Ok(())
    }
}

/// Ordered enrichers.
#[derive(Clone)]
pub struct EnricherPipeline {
    enrichers: Vec<Arc<dyn Enricher>>,
}

impl EnricherPipeline {
    /// No enrichers.
    pub fn empty() -> Self {
        Self {
            enrichers: Vec::new(),
        }
    }

    /// Correlation id, message id, source service and timestamp.
    pub fn with_defaults() -> Self {
        let mut pipeline = Self::empty();
        pipeline
            .push(CorrelationIdEnricher)
            .push(MessageIdEnricher)
            .push(SourceServiceEnricher)
            .push(TimestampEnricher);
        pipeline
    }

    pub fn push(&mut self, enricher: impl Enricher + 'static) -> &mut Self {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    /// Drop every enricher, defaults included.
    pub fn clear(&mut self) -> &mut Self {
        self.enrichers.clear();
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.enrichers.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.enrichers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrichers.is_empty()
    }

    /// Run every enricher in order. Failures don't stop later enrichers;
    /// they are collected into one error.
    pub fn run(&self, headers: &mut Headers, ctx: &EnrichContext<'_>) -> Result<(), PipelineError> {
        let failures: Vec<ComponentFailure> = self
            .enrichers
            .iter()
            .filter_map(|enricher| {
                enricher
                    .enrich(headers, ctx)
                    .err()
                    .map(|source| ComponentFailure {
                        component: enricher.name().to_owned(),
                        source,
                    })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError {
                phase: PipelinePhase::Enrich,
                failures,
            })
        }
    }
}

impl Default for EnricherPipeline {
    fn default() -> Self {
        Self::with_defaults()
    }
}
