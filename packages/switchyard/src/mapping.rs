//! Result mapping and result slots.
//!
//! A consumer may return a different type than the command or query declares
//! (a persistence model instead of a DTO, say). The [`ResultMapper`] converts
//! between them; the [`ResultSlot`] then holds the declared value and refuses
//! anything else.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::AnyOutput;
use crate::descriptor::TypeInfo;
use crate::error::{BusError, MappingError};

type MapFn = Arc<dyn Fn(AnyOutput) -> Option<AnyOutput> + Send + Sync>;

/// Registered source-to-target conversions.
#[derive(Clone, Default)]
pub struct ResultMapper {
    strategies: HashMap<(TypeId, TypeId), Vec<MapFn>>,
}

impl ResultMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `S -> T`. Also registers `Vec<S> -> Vec<T>`, mapping each
    /// element.
    pub fn register<S, T, F>(&mut self, map: F) -> &mut Self
    where
        S: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(S) -> T + Send + Sync + 'static,
    {
        let map = Arc::new(map);

        let single = map.clone();
        self.insert::<S, T>(Arc::new(move |value| {
            value
                .downcast::<S>()
                .ok()
                .map(|s| Box::new(single(*s)) as AnyOutput)
        }));

        self.insert::<Vec<S>, Vec<T>>(Arc::new(move |value| {
            value.downcast::<Vec<S>>().ok().map(|items| {
                Box::new(items.into_iter().map(|s| map(s)).collect::<Vec<T>>()) as AnyOutput
            })
        }));
        self
    }

    fn insert<S: 'static, T: 'static>(&mut self, map: MapFn) {
        self.strategies
            .entry((TypeId::of::<S>(), TypeId::of::<T>()))
            .or_default()
            .push(map);
    }

    /// Whether a conversion is registered for the pair.
    pub fn supports(&self, from: TypeId, to: TypeId) -> bool {
        from == to || self.strategies.contains_key(&(from, to))
    }

    /// Convert `value` of type `from` into `to`. Identity when they match.
    pub fn map(&self, value: AnyOutput, from: TypeInfo, to: TypeInfo) -> Result<AnyOutput, MappingError> {
        if from.id == to.id {
            return Ok(value);
        }
        let no_strategy = MappingError::NoStrategy {
            from: from.name,
            to: to.name,
        };
        match self.strategies.get(&(from.id, to.id)).map(Vec::as_slice) {
            Some([map]) => map(value).ok_or(no_strategy),
            Some([]) | None => Err(no_strategy),
            Some(_) => Err(MappingError::MultipleStrategies {
                from: from.name,
                to: to.name,
            }),
        }
    }
}

/// Holds the declared result of one command or query. Set exactly once.
pub struct ResultSlot {
    expected: TypeInfo,
    value: Option<AnyOutput>,
}

impl ResultSlot {
    pub fn new(expected: TypeInfo) -> Self {
        Self {
            expected,
            value: None,
        }
    }

    /// Store the result.
    ///
    /// # Errors
    ///
    /// - [`BusError::ResultTypeMismatch`] when `value` is not the declared type
    /// - [`BusError::ResultAlreadySet`] on a second call
    pub fn set(&mut self, value: AnyOutput, actual: &'static str) -> Result<(), BusError> {
        if (*value).type_id() != self.expected.id {
            return Err(BusError::ResultTypeMismatch {
                expected: self.expected.name,
                actual,
            });
        }
        if self.value.is_some() {
            return Err(BusError::ResultAlreadySet {
                result_type: self.expected.name,
            });
        }
        self.value = Some(value);
        Ok(())
    }

    /// Swap in a replacement from a post-filter. Type checked like `set`.
    pub fn replace(&mut self, value: AnyOutput) -> Result<(), BusError> {
        if (*value).type_id() != self.expected.id {
            return Err(BusError::ResultTypeMismatch {
                expected: self.expected.name,
                actual: "<filter output>",
            });
        }
        self.value = Some(value);
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&AnyOutput> {
        self.value.as_ref()
    }

    pub fn into_inner(self) -> Option<AnyOutput> {
        self.value
    }
}
