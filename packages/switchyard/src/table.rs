//! The dispatch table: message type to descriptors.
//!
//! Built once from every [`Router`], read-only afterwards. For each known
//! message type the table precomputes the *closure*: the exact-type
//! descriptors plus every descriptor registered against a transitive base
//! type with `include_derived`, each paired with the upcast it needs. Types
//! the table first meets at dispatch get their closure computed once and
//! memoized.
//!
//! Matching is a pure lookup followed by predicate evaluation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::core::{AnyMessage, MessageKind, MessageType, Upcast};
use crate::descriptor::Descriptor;
use crate::error::BusError;
use crate::headers::Headers;
use crate::router::{Router, Routes};

/// A descriptor reachable from a concrete message type.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub(crate) descriptor: Arc<Descriptor>,
    /// Conversion into the descriptor's message type, for derived matches.
    pub(crate) upcast: Option<Upcast>,
}

/// A candidate whose predicate accepted the message.
pub struct Match {
    pub descriptor: Arc<Descriptor>,
    /// The message as the descriptor sees it, when it had to be upcast.
    pub(crate) upcast: Option<AnyMessage>,
}

impl Match {
    /// Whether this match came from a base-type registration.
    pub fn is_derived(&self) -> bool {
        self.upcast.is_some()
    }
}

/// Typical fan-out fits inline.
pub type Matches = SmallVec<[Match; 4]>;

/// Builder for [`DispatchTable`].
pub struct DispatchTableBuilder {
    routes: Routes,
    known: Vec<MessageType>,
}

impl DispatchTableBuilder {
    /// Collect every route a router registers.
    pub fn router<R: Router>(mut self, router: R) -> Self {
        self.routes.collect(&router);
        self
    }

    /// Precompute the closure for a type no router registers directly, such
    /// as a derived event only consumed through its base.
    pub fn known(mut self, message_type: MessageType) -> Self {
        self.known.push(message_type);
        self
    }

    /// Index the descriptors.
    ///
    /// # Errors
    ///
    /// - [`BusError::DuplicateConsumer`] when a command or query type has more
    ///   than one exact registration, or more than one unconditional match
    ///   once derived registrations are included
    /// - [`BusError::KindConflict`] when one type is registered under two kinds
    pub fn build(self) -> Result<DispatchTable, BusError> {
        let descriptors: Vec<Arc<Descriptor>> = self
            .routes
            .into_descriptors()
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut exact: HashMap<TypeId, Vec<Arc<Descriptor>>> = HashMap::new();
        let mut kinds: HashMap<TypeId, MessageKind> = HashMap::new();
        let mut types: Vec<MessageType> = Vec::new();

        for d in &descriptors {
            let mt = &d.message_type;
            match kinds.get(&mt.id()) {
                Some(&first) if first != mt.kind() => {
                    return Err(BusError::KindConflict {
                        message_type: mt.name(),
                        first,
                        second: mt.kind(),
                    });
                }
                Some(_) => {}
                None => {
                    kinds.insert(mt.id(), mt.kind());
                    types.push(mt.clone());
                }
            }
            exact.entry(mt.id()).or_default().push(d.clone());
        }

        for mt in &types {
            let registered = &exact[&mt.id()];
            if mt.kind().is_single_consumer() && registered.len() > 1 {
                return Err(duplicate(mt.name(), registered.iter()));
            }
        }

        let mut table = DispatchTable {
            descriptors,
            exact,
            closure: HashMap::new(),
            memo: DashMap::new(),
        };

        for mt in types.iter().chain(self.known.iter()) {
            let closure = table.compute_closure(mt);
            if mt.kind().is_single_consumer() {
                let unconditional: Vec<_> = closure
                    .iter()
                    .filter(|c| c.descriptor.predicate.is_none())
                    .map(|c| &c.descriptor)
                    .collect();
                if unconditional.len() > 1 {
                    return Err(duplicate(mt.name(), unconditional.into_iter()));
                }
            }
            table.closure.insert(mt.id(), closure);
        }

        debug!(
            descriptors = table.descriptors.len(),
            types = table.closure.len(),
            "dispatch table built"
        );
        Ok(table)
    }
}

fn duplicate<'a>(
    message_type: &'static str,
    descriptors: impl Iterator<Item = &'a Arc<Descriptor>>,
) -> BusError {
    BusError::DuplicateConsumer {
        message_type,
        consumers: descriptors.map(|d| d.consumer).collect(),
    }
}

/// Index from message type to descriptors.
pub struct DispatchTable {
    descriptors: Vec<Arc<Descriptor>>,
    exact: HashMap<TypeId, Vec<Arc<Descriptor>>>,
    closure: HashMap<TypeId, Arc<[Candidate]>>,
    memo: DashMap<TypeId, Arc<[Candidate]>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder {
            routes: Routes::new(),
            known: Vec::new(),
        }
    }

    /// Every descriptor, in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
        self.descriptors.iter()
    }

    /// Descriptors bound to an entity on `bus`, in registration order.
    pub fn wired(&self, bus: &str) -> impl Iterator<Item = &Arc<Descriptor>> + '_ {
        let bus = bus.to_owned();
        self.descriptors
            .iter()
            .filter(move |d| d.route.as_ref().is_some_and(|r| r.bus == bus))
    }

    /// Descriptors registered for exactly this type.
    pub fn exact(&self, message_type: &MessageType) -> &[Arc<Descriptor>] {
        self.exact
            .get(&message_type.id())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Every descriptor that applies to `message`, in registration order.
    ///
    /// `message` must be a value of `message_type`.
    pub fn candidates(
        &self,
        message_type: &MessageType,
        message: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> Matches {
        let closure = self.closure_for(message_type);
        let mut out = Matches::new();
        for candidate in closure.iter() {
            let upcast = match &candidate.upcast {
                None => None,
                Some(upcast) => match upcast(message) {
                    Some(value) => Some(value),
                    None => continue,
                },
            };
            let seen: &(dyn Any + Send + Sync) = upcast.as_deref().unwrap_or(message);
            if candidate.descriptor.matches(seen, headers) {
                out.push(Match {
                    descriptor: candidate.descriptor.clone(),
                    upcast,
                });
            }
        }
        out
    }

    /// The single descriptor for a command or query.
    pub fn resolve(
        &self,
        message_type: &MessageType,
        message: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> Result<Match, BusError> {
        let mut matches = self.candidates(message_type, message, headers);
        match matches.len() {
            0 => Err(BusError::NoConsumer {
                message_type: message_type.name(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(BusError::DuplicateConsumer {
                message_type: message_type.name(),
                consumers: matches.iter().map(|m| m.descriptor.consumer).collect(),
            }),
        }
    }

    fn closure_for(&self, message_type: &MessageType) -> Arc<[Candidate]> {
        if let Some(closure) = self.closure.get(&message_type.id()) {
            return closure.clone();
        }
        self.memo
            .entry(message_type.id())
            .or_insert_with(|| self.compute_closure(message_type))
            .clone()
    }

    fn compute_closure(&self, message_type: &MessageType) -> Arc<[Candidate]> {
        let mut out: Vec<Candidate> = self
            .exact
            .get(&message_type.id())
            .into_iter()
            .flatten()
            .map(|d| Candidate {
                descriptor: d.clone(),
                upcast: None,
            })
            .collect();

        for (base, _, upcast) in message_type.ancestors() {
            let derived = self
                .exact
                .get(&base)
                .into_iter()
                .flatten()
                .filter(|d| d.include_derived);
            for d in derived {
                out.push(Candidate {
                    descriptor: d.clone(),
                    upcast: Some(upcast.clone()),
                });
            }
        }

        out.sort_by_key(|c| c.descriptor.seq);
        out.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BaseType, Command, DomainEvent, Message};
    use crate::descriptor::{ConsumeContext, Consumer};
    use async_trait::async_trait;

    // =========================================================================
    // Fixtures
    // =========================================================================

    #[derive(Debug, Clone)]
    struct OrderEvent {
        amount: i64,
    }
    impl Message for OrderEvent {}
    impl DomainEvent for OrderEvent {}

    #[derive(Debug, Clone)]
    struct OrderShipped {
        amount: i64,
    }
    impl Message for OrderShipped {
        fn base_types() -> Vec<BaseType> {
            vec![BaseType::of::<OrderEvent, Self>()]
        }
    }
    impl DomainEvent for OrderShipped {}
    impl From<OrderShipped> for OrderEvent {
        fn from(e: OrderShipped) -> Self {
            OrderEvent { amount: e.amount }
        }
    }

    #[derive(Debug)]
    struct Charge;
    impl Message for Charge {}
    impl Command for Charge {
        type Result = ();
    }

    struct Sink;

    #[async_trait]
    impl Consumer<OrderEvent> for Sink {
        type Output = ();
        async fn consume(&self, _: OrderEvent, _: ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Consumer<OrderShipped> for Sink {
        type Output = ();
        async fn consume(&self, _: OrderShipped, _: ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Charger;

    #[async_trait]
    impl Consumer<Charge> for Charger {
        type Output = ();
        async fn consume(&self, _: Charge, _: ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct OtherCharger;

    #[async_trait]
    impl Consumer<Charge> for OtherCharger {
        type Output = ();
        async fn consume(&self, _: Charge, _: ConsumeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn events_table() -> DispatchTable {
        DispatchTable::builder()
            .router(|r: &mut Routes| {
                r.event::<OrderEvent, _>(Sink).include_derived(); // 0
                r.event::<OrderShipped, _>(Sink); // 1
                r.event::<OrderEvent, _>(Sink); // 2: exact only
                r.event::<OrderEvent, _>(Sink)
                    .include_derived()
                    .when(|e, _| e.amount > 100); // 3
            })
            .build()
            .unwrap()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    #[test]
    fn test_single_command_resolves() {
        let table = DispatchTable::builder()
            .router(|r: &mut Routes| {
                r.command::<Charge, _>(Charger);
            })
            .build()
            .unwrap();

        let m = table
            .resolve(&MessageType::command::<Charge>(), &Charge, &Headers::new())
            .unwrap();
        assert!(m.descriptor.consumer_name().ends_with("Charger"));
        assert!(!m.is_derived());
    }

    #[test]
    fn test_unregistered_command_is_no_consumer() {
        let table = DispatchTable::builder().build().unwrap();
        let err = table
            .resolve(&MessageType::command::<Charge>(), &Charge, &Headers::new())
            .err()
            .unwrap();
        assert!(matches!(err, BusError::NoConsumer { .. }));
    }

    #[test]
    fn test_duplicate_command_fails_at_build() {
        let err = DispatchTable::builder()
            .router(|r: &mut Routes| {
                r.command::<Charge, _>(Charger);
            })
            .router(|r: &mut Routes| {
                r.command::<Charge, _>(OtherCharger);
            })
            .build()
            .err()
            .unwrap();

        assert!(err.to_string().contains("multiple consumers"));
        match err {
            BusError::DuplicateConsumer { consumers, .. } => assert_eq!(consumers.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_with_predicates_still_fails_at_build() {
        let err = DispatchTable::builder()
            .router(|r: &mut Routes| {
                r.command::<Charge, _>(Charger).when(|_, _| true);
                r.command::<Charge, _>(OtherCharger).when(|_, _| false);
            })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BusError::DuplicateConsumer { .. }));
    }

    #[test]
    fn test_kind_conflict() {
        #[derive(Debug, Clone)]
        struct Both;
        impl Message for Both {}
        impl Command for Both {
            type Result = ();
        }
        impl DomainEvent for Both {}

        struct BothSink;
        #[async_trait]
        impl Consumer<Both> for BothSink {
            type Output = ();
            async fn consume(&self, _: Both, _: ConsumeContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let err = DispatchTable::builder()
            .router(|r: &mut Routes| {
                r.command::<Both, _>(BothSink);
                r.event::<Both, _>(BothSink);
            })
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BusError::KindConflict {
                first: MessageKind::Command,
                second: MessageKind::DomainEvent,
                ..
            }
        ));
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[test]
    fn test_derived_event_gets_union_in_registration_order() {
        let table = events_table();
        let shipped = OrderShipped { amount: 500 };
        let matches = table.candidates(
            &MessageType::event::<OrderShipped>(),
            &shipped,
            &Headers::new(),
        );

        let seqs: Vec<usize> = matches.iter().map(|m| m.descriptor.seq()).collect();
        assert_eq!(seqs, vec![0, 1, 3]);
        assert!(matches[0].is_derived());
        assert!(!matches[1].is_derived());

        let upcast = matches[0].upcast.as_ref().unwrap();
        assert_eq!(upcast.downcast_ref::<OrderEvent>().unwrap().amount, 500);
    }

    #[test]
    fn test_predicate_sees_upcast_value() {
        let table = events_table();
        let small = OrderShipped { amount: 5 };
        let matches = table.candidates(
            &MessageType::event::<OrderShipped>(),
            &small,
            &Headers::new(),
        );
        let seqs: Vec<usize> = matches.iter().map(|m| m.descriptor.seq()).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_base_event_skips_derived_only_registrations() {
        let table = events_table();
        let base = OrderEvent { amount: 1 };
        let matches = table.candidates(&MessageType::event::<OrderEvent>(), &base, &Headers::new());
        let seqs: Vec<usize> = matches.iter().map(|m| m.descriptor.seq()).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert!(matches.iter().all(|m| !m.is_derived()));
    }

    #[test]
    fn test_unregistered_derived_event_falls_back_to_base() {
        #[derive(Debug, Clone)]
        struct OrderRefunded {
            amount: i64,
        }
        impl Message for OrderRefunded {
            fn base_types() -> Vec<BaseType> {
                vec![BaseType::of::<OrderEvent, Self>()]
            }
        }
        impl DomainEvent for OrderRefunded {}
        impl From<OrderRefunded> for OrderEvent {
            fn from(e: OrderRefunded) -> Self {
                OrderEvent { amount: e.amount }
            }
        }

        let table = events_table();
        let mt = MessageType::event::<OrderRefunded>();
        let matches = table.candidates(&mt, &OrderRefunded { amount: 1 }, &Headers::new());
        let seqs: Vec<usize> = matches.iter().map(|m| m.descriptor.seq()).collect();
        assert_eq!(seqs, vec![0]);

        // memoized on first sight
        assert!(table.memo.contains_key(&mt.id()));
    }

    #[test]
    fn test_known_types_are_precomputed() {
        let table = DispatchTable::builder()
            .router(|r: &mut Routes| {
                r.event::<OrderEvent, _>(Sink).include_derived();
            })
            .known(MessageType::event::<OrderShipped>())
            .build()
            .unwrap();

        assert!(table.closure.contains_key(&TypeId::of::<OrderShipped>()));
        assert!(table.memo.is_empty());
    }

    #[test]
    fn test_event_without_consumers_is_empty() {
        let table = DispatchTable::builder().build().unwrap();
        let matches = table.candidates(
            &MessageType::event::<OrderEvent>(),
            &OrderEvent { amount: 1 },
            &Headers::new(),
        );
        assert!(matches.is_empty());
    }
}
