//! Query filters.
//!
//! Filters wrap query consumers in two phases:
//!
//! ```text
//! pre-filters (concurrent) ──▶ consumer ──▶ result mapping ──▶ post-filters (concurrent)
//!      │ first Some wins                                          │ last Some wins
//!      └─▶ short-circuit, consumer skipped                        └─▶ replaces result
//! ```
//!
//! Every filter in a phase runs, even when one fails; the failures come back
//! together as one [`PipelineError`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::core::{AnyOutput, Query};
use crate::error::{ComponentFailure, PipelineError, PipelinePhase};
use crate::headers::Headers;

/// Validates, short-circuits, or post-processes one query type.
///
/// Both phases default to "no opinion".
///
/// # Example
///
/// ```ignore
/// struct CachedUsers(Cache);
///
/// #[async_trait]
/// impl QueryFilter<GetUser> for CachedUsers {
///     async fn before(&self, q: &GetUser, _h: &Headers) -> Result<Option<User>> {
///         Ok(self.0.get(&q.id))
///     }
/// }
/// ```
#[async_trait]
pub trait QueryFilter<Q: Query>: Send + Sync + 'static {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Runs before the consumer. `Some` answers the query without it.
    async fn before(&self, _query: &Q, _headers: &Headers) -> anyhow::Result<Option<Q::Result>> {
        Ok(None)
    }

    /// Runs after the consumer. `Some` replaces the result.
    async fn after(
        &self,
        _query: &Q,
        _result: &Q::Result,
        _headers: &Headers,
    ) -> anyhow::Result<Option<Q::Result>> {
        Ok(None)
    }
}

#[async_trait]
pub(crate) trait AnyFilter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before_any(
        &self,
        query: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> anyhow::Result<Option<AnyOutput>>;

    async fn after_any(
        &self,
        query: &(dyn Any + Send + Sync),
        result: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> anyhow::Result<Option<AnyOutput>>;
}

struct FilterWrapper<F, Q> {
    filter: F,
    _query: PhantomData<fn(Q)>,
}

#[async_trait]
impl<F, Q> AnyFilter for FilterWrapper<F, Q>
where
    F: QueryFilter<Q>,
    Q: Query,
{
    fn name(&self) -> &'static str {
        self.filter.name()
    }

    async fn before_any(
        &self,
        query: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> anyhow::Result<Option<AnyOutput>> {
        let query = downcast::<Q>(query)?;
        let replaced = self.filter.before(query, headers).await?;
        Ok(replaced.map(|r| Box::new(r) as AnyOutput))
    }

    async fn after_any(
        &self,
        query: &(dyn Any + Send + Sync),
        result: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> anyhow::Result<Option<AnyOutput>> {
        let query = downcast::<Q>(query)?;
        let result = downcast::<Q::Result>(result)?;
        let replaced = self.filter.after(query, result, headers).await?;
        Ok(replaced.map(|r| Box::new(r) as AnyOutput))
    }
}

fn downcast<T: 'static>(value: &(dyn Any + Send + Sync)) -> anyhow::Result<&T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow::anyhow!("filter expected {}", std::any::type_name::<T>()))
}

/// Filters by query type, in registration order.
#[derive(Clone, Default)]
pub struct QueryFilters {
    by_query: HashMap<TypeId, Vec<Arc<dyn AnyFilter>>>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter for `Q`.
    pub fn add<Q, F>(&mut self, filter: F) -> &mut Self
    where
        Q: Query,
        F: QueryFilter<Q>,
    {
        self.by_query
            .entry(TypeId::of::<Q>())
            .or_default()
            .push(Arc::new(FilterWrapper {
                filter,
                _query: PhantomData,
            }));
        self
    }

    pub fn count(&self, query: TypeId) -> usize {
        self.by_query.get(&query).map_or(0, Vec::len)
    }

    fn for_query(&self, query: TypeId) -> &[Arc<dyn AnyFilter>] {
        self.by_query.get(&query).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run every pre-filter for the query concurrently.
    ///
    /// Returns the first short-circuit result in registration order.
    pub(crate) async fn run_before(
        &self,
        query_type: TypeId,
        query: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> Result<Option<AnyOutput>, PipelineError> {
        let filters = self.for_query(query_type);
        if filters.is_empty() {
            return Ok(None);
        }
        let outcomes = join_all(filters.iter().map(|f| f.before_any(query, headers))).await;
        let mut overrides = collect(PipelinePhase::PreFilter, filters, outcomes)?;
        Ok(if overrides.is_empty() {
            None
        } else {
            Some(overrides.remove(0))
        })
    }

    /// Run every post-filter for the query concurrently.
    ///
    /// Returns the last replacement result in registration order.
    pub(crate) async fn run_after(
        &self,
        query_type: TypeId,
        query: &(dyn Any + Send + Sync),
        result: &(dyn Any + Send + Sync),
        headers: &Headers,
    ) -> Result<Option<AnyOutput>, PipelineError> {
        let filters = self.for_query(query_type);
        if filters.is_empty() {
            return Ok(None);
        }
        let outcomes =
            join_all(filters.iter().map(|f| f.after_any(query, result, headers))).await;
        let overrides = collect(PipelinePhase::PostFilter, filters, outcomes)?;
        Ok(overrides.into_iter().last())
    }
}

fn collect(
    phase: PipelinePhase,
    filters: &[Arc<dyn AnyFilter>],
    outcomes: Vec<anyhow::Result<Option<AnyOutput>>>,
) -> Result<Vec<AnyOutput>, PipelineError> {
    let mut overrides = Vec::new();
    let mut failures = Vec::new();
    for (filter, outcome) in filters.iter().zip(outcomes) {
        match outcome {
            Ok(Some(value)) => overrides.push(value),
            Ok(None) => {}
            Err(source) => failures.push(ComponentFailure {
                component: filter.name().to_owned(),
                source,
            }),
        }
    }
    if failures.is_empty() {
        Ok(overrides)
    } else {
        Err(PipelineError { phase, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Message;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Lookup(u32);
    impl Message for Lookup {}
    impl Query for Lookup {
        type Result = String;
    }

    struct Answer {
        name: &'static str,
        before: Option<&'static str>,
        after: Option<&'static str>,
        delay_ms: u64,
    }

    impl Answer {
        fn quiet(name: &'static str) -> Self {
            Self {
                name,
                before: None,
                after: None,
                delay_ms: 0,
            }
        }
    }

    #[async_trait]
    impl QueryFilter<Lookup> for Answer {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn before(&self, _q: &Lookup, _h: &Headers) -> anyhow::Result<Option<String>> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(self.before.map(str::to_owned))
        }

        async fn after(
            &self,
            _q: &Lookup,
            result: &String,
            _h: &Headers,
        ) -> anyhow::Result<Option<String>> {
            Ok(self.after.map(|a| format!("{result}+{a}")))
        }
    }

    struct Reject(&'static str);

    #[async_trait]
    impl QueryFilter<Lookup> for Reject {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn before(&self, q: &Lookup, _h: &Headers) -> anyhow::Result<Option<String>> {
            anyhow::bail!("{} rejects {}", self.0, q.0)
        }
    }

    fn output(value: Option<AnyOutput>) -> Option<String> {
        value.and_then(|v| v.downcast_ref::<String>().cloned())
    }

    #[tokio::test]
    async fn test_no_filters_is_no_opinion() {
        let filters = QueryFilters::new();
        let got = filters
            .run_before(TypeId::of::<Lookup>(), &Lookup(1), &Headers::new())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_first_pre_filter_override_wins() {
        let mut filters = QueryFilters::new();
        filters
            .add::<Lookup, _>(Answer::quiet("a"))
            .add::<Lookup, _>(Answer {
                before: Some("slow-but-first"),
                delay_ms: 30,
                ..Answer::quiet("b")
            })
            .add::<Lookup, _>(Answer {
                before: Some("fast-but-second"),
                ..Answer::quiet("c")
            });

        let got = filters
            .run_before(TypeId::of::<Lookup>(), &Lookup(1), &Headers::new())
            .await
            .unwrap();
        assert_eq!(output(got).as_deref(), Some("slow-but-first"));
    }

    #[tokio::test]
    async fn test_last_post_filter_override_wins() {
        let mut filters = QueryFilters::new();
        filters
            .add::<Lookup, _>(Answer {
                after: Some("x"),
                ..Answer::quiet("a")
            })
            .add::<Lookup, _>(Answer::quiet("b"))
            .add::<Lookup, _>(Answer {
                after: Some("y"),
                ..Answer::quiet("c")
            });

        let result = String::from("r");
        let got = filters
            .run_after(TypeId::of::<Lookup>(), &Lookup(1), &result, &Headers::new())
            .await
            .unwrap();
        assert_eq!(output(got).as_deref(), Some("r+y"));
    }

    #[tokio::test]
    async fn test_every_failure_is_reported() {
        let mut filters = QueryFilters::new();
        filters
            .add::<Lookup, _>(Reject("auth"))
            .add::<Lookup, _>(Answer {
                before: Some("ignored"),
                ..Answer::quiet("cache")
            })
            .add::<Lookup, _>(Reject("quota"));

        let err = filters
            .run_before(TypeId::of::<Lookup>(), &Lookup(7), &Headers::new())
            .await
            .unwrap_err();
        assert_eq!(err.phase, PipelinePhase::PreFilter);
        assert_eq!(err.components(), vec!["auth", "quota"]);
        assert!(err.to_string().contains("quota rejects 7"));
    }

    #[tokio::test]
    async fn test_pre_filters_run_concurrently() {
        let mut filters = QueryFilters::new();
        for name in ["a", "b", "c", "d"] {
            filters.add::<Lookup, _>(Answer {
                delay_ms: 40,
                ..Answer::quiet(name)
            });
        }

        let started = std::time::Instant::now();
        filters
            .run_before(TypeId::of::<Lookup>(), &Lookup(1), &Headers::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(140));
    }
}
