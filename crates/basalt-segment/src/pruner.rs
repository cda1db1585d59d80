use std::cmp::Ordering;

use basalt_common::Value;
use basalt_query::{Expression, FilterContext, Predicate, PredicateOp, QueryContext};
use tracing::debug;

use crate::manager::SegmentHandle;
use crate::segment::Segment;

/// One pruning rule over segment metadata.
///
/// A pruner may be conservative (keep a segment that contributes nothing) but
/// never unsafe (drop one that would contribute). Cost must be constant per
/// segment; no row data is touched.
pub trait SegmentPruner: Send + Sync {
    /// Rule name, used in debug logs.
    fn name(&self) -> &'static str;

    /// Whether the segment could contribute at least one row.
    fn keep(&self, segment: &dyn Segment, query: &QueryContext) -> bool;
}

/// Drops segments with no rows. Mutable segments are kept even at zero docs
/// so their freshness metadata still surfaces.
pub struct EmptySegmentPruner;

impl SegmentPruner for EmptySegmentPruner {
    fn name(&self) -> &'static str {
        "EmptySegmentPruner"
    }

    fn keep(&self, segment: &dyn Segment, _query: &QueryContext) -> bool {
        segment.total_docs() > 0 || segment.is_mutable()
    }
}

/// Drops segments whose column min/max ranges cannot satisfy the filter.
pub struct ColumnValueSegmentPruner;

impl SegmentPruner for ColumnValueSegmentPruner {
    fn name(&self) -> &'static str {
        "ColumnValueSegmentPruner"
    }

    fn keep(&self, segment: &dyn Segment, query: &QueryContext) -> bool {
        match &query.filter {
            Some(filter) => filter_may_match(filter, segment),
            None => true,
        }
    }
}

fn filter_may_match(filter: &FilterContext, segment: &dyn Segment) -> bool {
    match filter {
        // A conjunction cannot match once any child provably cannot.
        FilterContext::And(children) => children
            .iter()
            .all(|child| filter_may_match(child, segment)),
        FilterContext::Or(children) => children
            .iter()
            .any(|child| filter_may_match(child, segment)),
        FilterContext::Predicate(predicate) => predicate_may_match(predicate, segment),
    }
}

fn predicate_may_match(predicate: &Predicate, segment: &dyn Segment) -> bool {
    let Expression::Identifier(column) = &predicate.lhs else {
        return true;
    };
    let Some(data_source) = segment.data_source(column) else {
        return true;
    };
    let (Some(min), Some(max)) = (data_source.min_value(), data_source.max_value()) else {
        return true;
    };

    let in_range = |value: &Value| {
        min.compare(value) != Ordering::Greater && max.compare(value) != Ordering::Less
    };
    match predicate.op {
        PredicateOp::Eq => predicate.values.first().map(in_range).unwrap_or(true),
        PredicateOp::In => predicate.values.iter().any(in_range),
        PredicateOp::Gt => predicate
            .values
            .first()
            .map(|value| max.compare(value) == Ordering::Greater)
            .unwrap_or(true),
        PredicateOp::Ge => predicate
            .values
            .first()
            .map(|value| max.compare(value) != Ordering::Less)
            .unwrap_or(true),
        PredicateOp::Lt => predicate
            .values
            .first()
            .map(|value| min.compare(value) == Ordering::Less)
            .unwrap_or(true),
        PredicateOp::Le => predicate
            .values
            .first()
            .map(|value| min.compare(value) != Ordering::Greater)
            .unwrap_or(true),
        PredicateOp::Between => match predicate.values.as_slice() {
            [low, high, ..] => {
                max.compare(low) != Ordering::Less && min.compare(high) != Ordering::Greater
            }
            _ => true,
        },
        // Exclusion predicates need the full dictionary to prune; keep.
        PredicateOp::NotEq | PredicateOp::NotIn => true,
    }
}

/// Composes pruners; the kept set is the intersection of each pruner's kept
/// set, realized by sequential application.
pub struct SegmentPrunerService {
    pruners: Vec<Box<dyn SegmentPruner>>,
}

impl SegmentPrunerService {
    pub fn new(pruners: Vec<Box<dyn SegmentPruner>>) -> Self {
        Self { pruners }
    }

    /// Default rule set: empty-segment and column-value pruning.
    pub fn with_default_pruners() -> Self {
        Self::new(vec![
            Box::new(EmptySegmentPruner),
            Box::new(ColumnValueSegmentPruner),
        ])
    }

    /// Returns the handles that may contribute rows; dropped handles release
    /// their segments immediately.
    pub fn prune(&self, handles: Vec<SegmentHandle>, query: &QueryContext) -> Vec<SegmentHandle> {
        let before = handles.len();
        let mut kept = handles;
        for pruner in &self.pruners {
            kept.retain(|handle| pruner.keep(handle.segment().as_ref(), query));
        }
        debug!(
            kept = kept.len(),
            pruned = before - kept.len(),
            "segment pruning done"
        );
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TableDataManager;
    use crate::memory::MemorySegmentBuilder;
    use basalt_common::ColumnType;
    use std::sync::Arc;

    fn manager_with_segments() -> TableDataManager {
        let manager = TableDataManager::new("t_OFFLINE");
        manager.add_segment(Arc::new(
            MemorySegmentBuilder::new("low")
                .column(
                    "x",
                    ColumnType::Long,
                    vec![Value::Long(1), Value::Long(5)],
                )
                .build(),
        ));
        manager.add_segment(Arc::new(
            MemorySegmentBuilder::new("high")
                .column(
                    "x",
                    ColumnType::Long,
                    vec![Value::Long(100), Value::Long(200)],
                )
                .build(),
        ));
        manager.add_segment(Arc::new(MemorySegmentBuilder::new("empty").build()));
        manager
    }

    fn names(handles: &[SegmentHandle]) -> Vec<&str> {
        handles.iter().map(|h| h.segment().name()).collect()
    }

    #[test]
    fn prunes_by_column_range() {
        let manager = manager_with_segments();
        let handles = manager.acquire_segments(&[
            "low".to_string(),
            "high".to_string(),
        ]);
        let query = QueryContext::builder(vec![Expression::identifier("x")])
            .filter(FilterContext::predicate(
                Expression::identifier("x"),
                PredicateOp::Eq,
                vec![Value::Long(150)],
            ))
            .build();
        let kept = SegmentPrunerService::with_default_pruners().prune(handles, &query);
        assert_eq!(names(&kept), vec!["high"]);
        // Pruned handles released immediately.
        assert_eq!(manager.segment_refcount("low"), Some(0));
        assert_eq!(manager.segment_refcount("high"), Some(1));
    }

    #[test]
    fn prunes_empty_segments_without_filter() {
        let manager = manager_with_segments();
        let handles = manager.acquire_segments(&[
            "low".to_string(),
            "empty".to_string(),
        ]);
        let query = QueryContext::builder(vec![Expression::identifier("x")]).build();
        let kept = SegmentPrunerService::with_default_pruners().prune(handles, &query);
        assert_eq!(names(&kept), vec!["low"]);
    }

    #[test]
    fn range_predicates_prune_conservatively() {
        let manager = manager_with_segments();
        let query = |op, values| {
            QueryContext::builder(vec![Expression::identifier("x")])
                .filter(FilterContext::predicate(
                    Expression::identifier("x"),
                    op,
                    values,
                ))
                .build()
        };
        let service = SegmentPrunerService::with_default_pruners();

        let handles = manager.acquire_segments(&["low".to_string(), "high".to_string()]);
        let kept = service.prune(handles, &query(PredicateOp::Gt, vec![Value::Long(50)]));
        assert_eq!(names(&kept), vec!["high"]);

        let handles = manager.acquire_segments(&["low".to_string(), "high".to_string()]);
        let kept = service.prune(
            handles,
            &query(PredicateOp::Between, vec![Value::Long(2), Value::Long(4)]),
        );
        assert_eq!(names(&kept), vec!["low"]);

        // NotEq cannot prune from min/max alone.
        let handles = manager.acquire_segments(&["low".to_string(), "high".to_string()]);
        let kept = service.prune(handles, &query(PredicateOp::NotEq, vec![Value::Long(1)]));
        assert_eq!(kept.len(), 2);
    }
}
