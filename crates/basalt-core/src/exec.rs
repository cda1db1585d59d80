use std::cmp::Ordering;

use basalt_common::{BasaltError, ColumnType, Result, Value};
use basalt_query::{Expression, FilterContext, Predicate, PredicateOp};
use basalt_segment::Segment;

/// Scan counters accumulated per segment and summed by the combine node.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStatistics {
    /// Docs matched by the filter.
    pub num_docs_scanned: u64,
    /// Entries visited while evaluating the filter.
    pub num_entries_scanned_in_filter: u64,
    /// Entries visited while projecting/aggregating matched docs.
    pub num_entries_scanned_post_filter: u64,
}

impl ScanStatistics {
    /// Adds another segment's counters into this one.
    pub fn merge(&mut self, other: &ScanStatistics) {
        self.num_docs_scanned += other.num_docs_scanned;
        self.num_entries_scanned_in_filter += other.num_entries_scanned_in_filter;
        self.num_entries_scanned_post_filter += other.num_entries_scanned_post_filter;
    }
}

/// Evaluates an expression against one row of a segment.
///
/// Transform functions are compiled outside this core; a function expression
/// reaching the row interpreter is a bad query, not a server fault.
pub fn evaluate(segment: &dyn Segment, expression: &Expression, row: usize) -> Result<Value> {
    match expression {
        Expression::Identifier(column) => segment
            .data_source(column)
            .map(|data_source| data_source.value(row))
            .ok_or_else(|| BasaltError::BadQuery(format!("unknown column: {column}"))),
        Expression::Literal(value) => Ok(value.clone()),
        Expression::Function(call) => Err(BasaltError::BadQuery(format!(
            "unsupported transform in row scan: {call}"
        ))),
    }
}

/// Result-column type of an expression over a segment.
pub fn expression_column_type(
    segment: &dyn Segment,
    expression: &Expression,
) -> Result<ColumnType> {
    match expression {
        Expression::Identifier(column) => segment
            .data_source(column)
            .map(|data_source| data_source.column_type())
            .ok_or_else(|| BasaltError::BadQuery(format!("unknown column: {column}"))),
        Expression::Literal(value) => Ok(match value {
            Value::Int(_) => ColumnType::Int,
            Value::Long(_) => ColumnType::Long,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Bytes(_) => ColumnType::Bytes,
            Value::Object(_) => ColumnType::Object,
            _ => ColumnType::String,
        }),
        Expression::Function(call) => Err(BasaltError::BadQuery(format!(
            "unsupported transform in row scan: {call}"
        ))),
    }
}

/// Evaluates a filter tree against one row, counting filter entries scanned.
pub fn filter_matches(
    segment: &dyn Segment,
    filter: &FilterContext,
    row: usize,
    stats: &mut ScanStatistics,
) -> Result<bool> {
    match filter {
        FilterContext::And(children) => {
            for child in children {
                if !filter_matches(segment, child, row, stats)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterContext::Or(children) => {
            for child in children {
                if filter_matches(segment, child, row, stats)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterContext::Predicate(predicate) => predicate_matches(segment, predicate, row, stats),
    }
}

fn predicate_matches(
    segment: &dyn Segment,
    predicate: &Predicate,
    row: usize,
    stats: &mut ScanStatistics,
) -> Result<bool> {
    stats.num_entries_scanned_in_filter += 1;
    let lhs = evaluate(segment, &predicate.lhs, row)?;
    if matches!(lhs, Value::Null) {
        return Ok(false);
    }
    let first = || {
        predicate.values.first().ok_or_else(|| {
            BasaltError::BadQuery(format!("predicate on {} has no value", predicate.lhs))
        })
    };
    Ok(match predicate.op {
        PredicateOp::Eq => lhs.compare(first()?) == Ordering::Equal,
        PredicateOp::NotEq => lhs.compare(first()?) != Ordering::Equal,
        PredicateOp::Gt => lhs.compare(first()?) == Ordering::Greater,
        PredicateOp::Ge => lhs.compare(first()?) != Ordering::Less,
        PredicateOp::Lt => lhs.compare(first()?) == Ordering::Less,
        PredicateOp::Le => lhs.compare(first()?) != Ordering::Greater,
        PredicateOp::Between => match predicate.values.as_slice() {
            [low, high, ..] => {
                lhs.compare(low) != Ordering::Less && lhs.compare(high) != Ordering::Greater
            }
            _ => {
                return Err(BasaltError::BadQuery(format!(
                    "between predicate on {} needs two bounds",
                    predicate.lhs
                )))
            }
        },
        PredicateOp::In => predicate
            .values
            .iter()
            .any(|value| lhs.compare(value) == Ordering::Equal),
        PredicateOp::NotIn => predicate
            .values
            .iter()
            .all(|value| lhs.compare(value) != Ordering::Equal),
    })
}
