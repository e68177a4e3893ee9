//! Wiring the calc service onto a bus.
//!
//! Generic over the transport so the same wiring runs on NATS in production
//! and on the in-memory broker in tests.

use std::sync::Arc;

use anyhow::{Context, Result};
use switchyard::rpc::{ReplyQueue, RpcClient};
use switchyard::{
    plan_entities, BusDriver, BusEntity, BusError, ConnectionManager, Dispatcher, EntityInfo, Headers, MessageType,
    QueueSender, ReplyRouter, RpcSettings, SerializerRegistry, StrategyFactory, TransportReplySender,
};
use tracing::info;

use crate::calc::{
    CalcRouter, CalculateRange, GetLastRange, Range, RangeCalculated, RangeHistory, EVENTS_TOPIC,
    RANGE_CALCULATED_KEY, RPC_QUEUE,
};

/// Reply routing for `bus`, sending through `sender`.
pub fn reply_router<T: Send + Sync + 'static>(
    bus: &str,
    manager: &Arc<ConnectionManager<T>>,
    sender: Arc<dyn QueueSender<T>>,
) -> ReplyRouter {
    let replies = ReplyRouter::new();
    replies.route(bus, Arc::new(TransportReplySender::new(bus, manager.clone(), sender)));
    replies
}

/// The serving side: RPC queue plus the audit subscription.
pub struct CalcServer<T> {
    driver: BusDriver<T>,
    history: RangeHistory,
}

impl<T: Send + Sync + 'static> CalcServer<T> {
    /// Plan and build the server's entities. Call [`BusDriver::start`] on
    /// [`driver`](Self::driver) to declare them.
    pub fn new(
        service: &str,
        bus: &str,
        manager: Arc<ConnectionManager<T>>,
        factory: &dyn StrategyFactory<T>,
        replies: &ReplyRouter,
    ) -> Result<Self> {
        let history = RangeHistory::default();
        let dispatcher = Dispatcher::builder(service)
            .router(CalcRouter::new(bus, history.clone()))
            .build()
            .context("invalid calc routes")?;

        let entities = plan_entities(&dispatcher, bus, factory, replies).context("failed to plan entities")?;
        for entity in &entities {
            info!(entity = %entity.info(), "planned");
        }

        let driver = BusDriver::builder(bus, manager, dispatcher).entities(entities).build();
        Ok(Self { driver, history })
    }

    pub fn driver(&self) -> &BusDriver<T> {
        &self.driver
    }

    pub fn history(&self) -> &RangeHistory {
        &self.history
    }
}

/// The calling side: a private reply queue and references to the calc
/// service's RPC queue and events topic.
pub struct CalcGateway<T> {
    driver: Arc<BusDriver<T>>,
    client: RpcClient,
}

impl<T: Send + Sync + 'static> CalcGateway<T> {
    pub async fn start(
        service: &str,
        bus: &str,
        manager: Arc<ConnectionManager<T>>,
        factory: &dyn StrategyFactory<T>,
        rpc: RpcSettings,
    ) -> Result<Self> {
        let replies = Arc::new(ReplyQueue::new(bus, &format!("{service}-replies")));
        let dispatcher = Dispatcher::builder(service).build()?;

        let driver = Arc::new(
            BusDriver::builder(bus, manager, dispatcher)
                .entity(replies.entity(factory))
                .entity(BusEntity::from_factory(
                    EntityInfo::reference(bus, RPC_QUEUE)
                        .accepting(&MessageType::command::<CalculateRange>())
                        .accepting(&MessageType::query::<GetLastRange>()),
                    factory,
                ))
                .entity(BusEntity::from_factory(
                    EntityInfo::reference(bus, EVENTS_TOPIC)
                        .accepting(&MessageType::event::<RangeCalculated>())
                        .with_route_key(RANGE_CALCULATED_KEY),
                    factory,
                ))
                .build(),
        );
        driver.start().await.context("failed to start gateway entities")?;
        info!(reply_queue = replies.name(), "gateway started");

        let client = RpcClient::new(driver.clone(), replies, SerializerRegistry::default(), rpc);
        Ok(Self { driver, client })
    }

    /// Ask the calc service for the range of `values` and announce it.
    pub async fn calculate(&self, values: Vec<i64>) -> Result<Range, BusError> {
        let range = self.client.call(&CalculateRange { values }).await?;
        self.driver
            .publish_event(&RangeCalculated { range }, Headers::new())
            .await?;
        Ok(range)
    }

    pub async fn last_range(&self) -> Result<Option<Range>, BusError> {
        self.client.ask(&GetLastRange).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let canceled = self.client.replies().shutdown();
        if canceled > 0 {
            info!(canceled, "canceled pending calls");
        }
        self.driver.shutdown().await?;
        Ok(())
    }
}
