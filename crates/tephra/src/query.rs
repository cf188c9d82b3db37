//! Minimal query surface consumed by the storage core.
//!
//! The full filter tree and query planner live outside this crate; the
//! core only needs a time range, a series-id predicate, and a push
//! sink. The sink returns `false` to stop a scan or merge early; the
//! producer treats that as graceful termination.

use std::collections::HashSet;

use crate::types::{ParamId, QueryRange, Sample};

/// Consumer of query results.
///
/// Returning `false` from [`put`](SampleSink::put) interrupts the
/// producer; partial results already delivered stay valid.
pub trait SampleSink {
    /// Offers one sample to the consumer. Returns `false` to stop.
    fn put(&mut self, sample: Sample) -> bool;
}

impl<F: FnMut(Sample) -> bool> SampleSink for F {
    fn put(&mut self, sample: Sample) -> bool {
        self(sample)
    }
}

/// Collects every offered sample; never interrupts.
#[derive(Debug, Default)]
pub struct VecSink {
    /// Samples received so far, in delivery order.
    pub samples: Vec<Sample>,
}

impl SampleSink for VecSink {
    fn put(&mut self, sample: Sample) -> bool {
        self.samples.push(sample);
        true
    }
}

/// Series-id predicate applied before samples reach the sink.
#[derive(Debug, Clone)]
pub enum IdFilter {
    /// Accept every series.
    All,
    /// Accept a single series.
    Single(ParamId),
    /// Accept an explicit id set.
    Set(HashSet<ParamId>),
}

impl IdFilter {
    /// Returns true if `id` passes the filter.
    pub fn accept(&self, id: ParamId) -> bool {
        match self {
            IdFilter::All => true,
            IdFilter::Single(wanted) => *wanted == id,
            IdFilter::Set(ids) => ids.contains(&id),
        }
    }
}

/// A range query over the storage.
#[derive(Debug, Clone)]
pub struct Query {
    /// Inclusive time range and scan direction.
    pub range: QueryRange,
    /// Series filter.
    pub filter: IdFilter,
}

impl Query {
    /// Creates a query over `range` accepting every series.
    pub fn new(range: QueryRange) -> Self {
        Self {
            range,
            filter: IdFilter::All,
        }
    }

    /// Restricts the query to a single series.
    pub fn with_series(mut self, id: ParamId) -> Self {
        self.filter = IdFilter::Single(id);
        self
    }

    /// Restricts the query to an id set.
    pub fn with_series_set(mut self, ids: HashSet<ParamId>) -> Self {
        self.filter = IdFilter::Set(ids);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryRange;

    #[test]
    fn test_filters() {
        assert!(IdFilter::All.accept(7));
        assert!(IdFilter::Single(7).accept(7));
        assert!(!IdFilter::Single(7).accept(8));
        let set: HashSet<ParamId> = [1, 2].into_iter().collect();
        assert!(IdFilter::Set(set.clone()).accept(2));
        assert!(!IdFilter::Set(set).accept(3));
    }

    #[test]
    fn test_closure_sink_interrupts() {
        let mut seen = 0;
        let mut sink = |_sample: Sample| {
            seen += 1;
            seen < 2
        };
        assert!(sink.put(Sample::new(1, 1, 0.0)));
        assert!(!sink.put(Sample::new(1, 2, 0.0)));
    }

    #[test]
    fn test_query_builder() {
        let query = Query::new(QueryRange::forward(0, 10)).with_series(42);
        assert!(query.filter.accept(42));
        assert!(!query.filter.accept(43));
    }
}
