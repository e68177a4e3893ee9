//! Turns a dispatcher's wired routes into bus entities.
//!
//! | Route kind         | Entity                                    |
//! |--------------------|-------------------------------------------|
//! | queue              | one entity, exactly one descriptor        |
//! | topic subscription | one entity per descriptor                 |
//! | channel            | one entity per descriptor                 |
//! | rpc                | one entity per queue, namespace map       |
//!
//! Publish-only references and the reply queue are not planned here; the
//! host declares them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::Descriptor;
use crate::dispatch::Dispatcher;
use crate::driver::ReplyRouter;
use crate::entity::{BusEntity, EntityInfo, EntityKind, StrategyFactory};
use crate::error::BusError;
use crate::inbound::DescriptorReceiver;
use crate::rpc::RpcResponder;

/// Plan every entity `dispatcher` needs on `bus`, in route registration order.
///
/// # Errors
///
/// [`BusError::DuplicateConsumer`] when two routes claim one queue, or two
/// RPC routes on one queue share a namespace.
pub fn plan_entities<T>(
    dispatcher: &Dispatcher,
    bus: &str,
    factory: &dyn StrategyFactory<T>,
    replies: &ReplyRouter,
) -> Result<Vec<BusEntity<T>>, BusError> {
    enum Planned {
        Single(EntityInfo, Arc<Descriptor>),
        Rpc(EntityInfo, RpcResponder),
    }

    let mut planned: Vec<Planned> = Vec::new();
    let mut queues: HashMap<String, usize> = HashMap::new();
    let mut rpc: HashMap<String, usize> = HashMap::new();

    for descriptor in dispatcher.table().wired(bus) {
        let Some(route) = descriptor.route() else {
            continue;
        };
        let mut info = EntityInfo::new(bus, route.entity.clone(), route.kind.clone())
            .with_options(route.options.clone());
        info.route_key = route.route_key.clone();

        match &route.kind {
            EntityKind::Rpc => match rpc.get(&route.entity) {
                Some(&at) => {
                    if let Planned::Rpc(_, responder) = &mut planned[at] {
                        responder.route(descriptor.clone())?;
                    }
                }
                None => {
                    let mut responder = RpcResponder::new(dispatcher.clone(), replies.clone());
                    responder.route(descriptor.clone())?;
                    rpc.insert(route.entity.clone(), planned.len());
                    planned.push(Planned::Rpc(info, responder));
                }
            },
            EntityKind::Queue => {
                if let Some(&at) = queues.get(&route.entity) {
                    let Planned::Single(_, first) = &planned[at] else {
                        continue;
                    };
                    return Err(BusError::DuplicateConsumer {
                        message_type: descriptor.message_type().name(),
                        consumers: vec![first.consumer_name(), descriptor.consumer_name()],
                    });
                }
                queues.insert(route.entity.clone(), planned.len());
                planned.push(Planned::Single(info, descriptor.clone()));
            }
            _ => planned.push(Planned::Single(info, descriptor.clone())),
        }
    }

    let entities: Vec<BusEntity<T>> = planned
        .into_iter()
        .map(|p| match p {
            Planned::Single(info, descriptor) => BusEntity::from_factory(info, factory)
                .with_sink(Arc::new(DescriptorReceiver::new(dispatcher.clone(), descriptor))),
            Planned::Rpc(info, responder) => {
                BusEntity::from_factory(info, factory).with_sink(Arc::new(responder))
            }
        })
        .collect();

    debug!(bus, entities = entities.len(), "entities planned");
    Ok(entities)
}
