//! Range calculation: messages, consumers and routes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard::{Command, ConsumeContext, Consumer, DomainEvent, Message, Query, RouteMetadata, Router, Routes};
use tracing::info;

/// RPC queue serving every calc request.
pub const RPC_QUEUE: &str = "calc-rpc";
/// Topic calculated ranges are announced on.
pub const EVENTS_TOPIC: &str = "calc-events";
/// This service's subscription on [`EVENTS_TOPIC`].
pub const AUDIT_SUBSCRIPTION: &str = "calc-audit";
/// Route key stamped on [`RangeCalculated`].
pub const RANGE_CALCULATED_KEY: &str = "range.calculated";

// =============================================================================
// Messages
// =============================================================================

/// Find the smallest and largest of `values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateRange {
    pub values: Vec<i64>,
}

impl Message for CalculateRange {}

impl Command for CalculateRange {
    type Result = Range;

    fn namespace() -> &'static str {
        "calc.range"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub min: i64,
    pub max: i64,
}

/// The most recently announced range, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLastRange;

impl Message for GetLastRange {}

impl Query for GetLastRange {
    type Result = Option<Range>;

    fn namespace() -> &'static str {
        "calc.last-range"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeCalculated {
    pub range: Range,
}

impl Message for RangeCalculated {}
impl DomainEvent for RangeCalculated {}

// =============================================================================
// Consumers
// =============================================================================

pub struct RangeCalculator;

#[async_trait]
impl Consumer<CalculateRange> for RangeCalculator {
    type Output = Range;

    async fn consume(&self, cmd: CalculateRange, _ctx: ConsumeContext) -> anyhow::Result<Range> {
        let min = cmd.values.iter().copied().min();
        let max = cmd.values.iter().copied().max();
        match (min, max) {
            (Some(min), Some(max)) => Ok(Range { min, max }),
            _ => anyhow::bail!("cannot take the range of an empty list"),
        }
    }
}

/// Ranges announced on the events topic, newest last.
#[derive(Clone, Default)]
pub struct RangeHistory(Arc<Mutex<Vec<Range>>>);

impl RangeHistory {
    pub fn last(&self) -> Option<Range> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).last().copied()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, range: Range) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(range);
    }
}

#[async_trait]
impl Consumer<RangeCalculated> for RangeHistory {
    type Output = ();

    async fn consume(&self, event: RangeCalculated, ctx: ConsumeContext) -> anyhow::Result<()> {
        info!(
            min = event.range.min,
            max = event.range.max,
            correlation_id = ?ctx.correlation_id(),
            "range calculated"
        );
        self.record(event.range);
        Ok(())
    }
}

#[async_trait]
impl Consumer<GetLastRange> for RangeHistory {
    type Output = Option<Range>;

    async fn consume(&self, _query: GetLastRange, _ctx: ConsumeContext) -> anyhow::Result<Option<Range>> {
        Ok(self.last())
    }
}

// =============================================================================
// Routes
// =============================================================================

/// Routes for the calc service on `bus`.
pub struct CalcRouter {
    bus: String,
    history: RangeHistory,
}

impl CalcRouter {
    pub fn new(bus: impl Into<String>, history: RangeHistory) -> Self {
        Self {
            bus: bus.into(),
            history,
        }
    }
}

impl Router for CalcRouter {
    fn routes(&self, routes: &mut Routes) {
        routes
            .command::<CalculateRange, _>(RangeCalculator)
            .via(RouteMetadata::rpc(&self.bus, RPC_QUEUE));
        routes
            .query::<GetLastRange, _>(self.history.clone())
            .via(RouteMetadata::rpc(&self.bus, RPC_QUEUE));
        routes
            .event::<RangeCalculated, _>(self.history.clone())
            .via(RouteMetadata::topic(&self.bus, EVENTS_TOPIC, AUDIT_SUBSCRIPTION).route_key("range.*"));
    }
}
