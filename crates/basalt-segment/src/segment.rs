use basalt_common::{ColumnType, Value};

/// Per-column dictionary contract.
///
/// A sorted dictionary exposes its value endpoints directly, which lets
/// aggregation-only min/max queries skip the scan entirely.
pub trait Dictionary: Send + Sync {
    /// Number of distinct values.
    fn len(&self) -> usize;

    /// Whether the dictionary has no values.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether dictionary ids are assigned in value order.
    fn is_sorted(&self) -> bool;

    /// Smallest value, when non-empty.
    fn min_value(&self) -> Option<Value>;

    /// Largest value, when non-empty.
    fn max_value(&self) -> Option<Value>;
}

/// Per-column read contract of a segment.
///
/// Metadata accessors (`min_value`, `max_value`, `dictionary`) are constant
/// cost and usable during pruning; `value` is the row-level read used by scan
/// plans.
pub trait DataSource: Send + Sync {
    /// Column data type.
    fn column_type(&self) -> ColumnType;

    /// Whether the column may contain nulls.
    fn is_nullable(&self) -> bool;

    /// Whether rows are stored in value order.
    fn is_sorted(&self) -> bool;

    /// Column dictionary, when one exists.
    fn dictionary(&self) -> Option<&dyn Dictionary>;

    /// Smallest stored value, when known from metadata.
    fn min_value(&self) -> Option<Value>;

    /// Largest stored value, when known from metadata.
    fn max_value(&self) -> Option<Value>;

    /// Value at `row`; `row` must be below the segment's total docs.
    fn value(&self, row: usize) -> Value;
}

/// Opaque read-only handle to one columnar segment.
///
/// Immutable segments never change after creation; mutable segments are still
/// ingesting and additionally report index/ingestion freshness timestamps.
pub trait Segment: Send + Sync {
    /// Segment name, unique within its table.
    fn name(&self) -> &str;

    /// Total row count.
    fn total_docs(&self) -> usize;

    /// Whether this segment is still ingesting.
    fn is_mutable(&self) -> bool;

    /// Wall-clock time of the last index commit, for mutable segments.
    fn last_indexed_timestamp_ms(&self) -> Option<i64> {
        None
    }

    /// Wall-clock time of the latest ingested row, for mutable segments.
    fn latest_ingestion_timestamp_ms(&self) -> Option<i64> {
        None
    }

    /// Data source for the named column, when the column exists.
    fn data_source(&self, column: &str) -> Option<&dyn DataSource>;
}
