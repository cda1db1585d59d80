use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Column data types supported by the result-table model.
///
/// `Object` columns carry aggregation intermediate results between server and
/// broker; every other type is a plain scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    Object,
}

/// Aggregation intermediates that are not plain scalars.
///
/// These travel inside `Value::Object` cells and are only unpacked by the
/// owning aggregation function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectValue {
    /// Running average state.
    AvgPair {
        /// Sum of accepted values.
        sum: f64,
        /// Count of accepted values.
        count: i64,
    },
    /// Running min/max endpoints.
    MinMaxPair {
        /// Minimum accepted value.
        min: f64,
        /// Maximum accepted value.
        max: f64,
    },
    /// Legacy per-aggregation group-by payload: group-key string to
    /// intermediate result.
    GroupMap(BTreeMap<String, Value>),
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ObjectValue::AvgPair { sum: s1, count: c1 },
                ObjectValue::AvgPair { sum: s2, count: c2 },
            ) => s1.to_bits() == s2.to_bits() && c1 == c2,
            (
                ObjectValue::MinMaxPair { min: a1, max: b1 },
                ObjectValue::MinMaxPair { min: a2, max: b2 },
            ) => a1.to_bits() == a2.to_bits() && b1.to_bits() == b2.to_bits(),
            (ObjectValue::GroupMap(m1), ObjectValue::GroupMap(m2)) => m1 == m2,
            _ => false,
        }
    }
}

impl Eq for ObjectValue {}

impl Hash for ObjectValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ObjectValue::AvgPair { sum, count } => {
                0_u8.hash(state);
                sum.to_bits().hash(state);
                count.hash(state);
            }
            ObjectValue::MinMaxPair { min, max } => {
                1_u8.hash(state);
                min.to_bits().hash(state);
                max.to_bits().hash(state);
            }
            ObjectValue::GroupMap(map) => {
                2_u8.hash(state);
                map.len().hash(state);
                for (k, v) in map {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

/// One typed cell of a result table.
///
/// Equality and hashing use bit patterns for floating-point variants so values
/// can serve as group-by key components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Object(ObjectValue),
}

impl Value {
    /// Numeric view, when the variant is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Integral view, when the variant is an integral type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order used for order-by ranking and min/max pruning.
    ///
    /// Numeric variants compare mutually through f64 total ordering; nulls
    /// sort first; mismatched non-numeric variants fall back to a stable
    /// variant rank so the order is still total.
    pub fn compare(&self, other: &Value) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.total_cmp(&b);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Long(_) => 2,
            Value::Float(_) => 3,
            Value::Double(_) => 4,
            Value::String(_) => 5,
            Value::Bytes(_) => 6,
            Value::Object(_) => 7,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0_u8.hash(state),
            Value::Int(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Value::Long(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Value::Float(v) => {
                3_u8.hash(state);
                v.to_bits().hash(state);
            }
            Value::Double(v) => {
                4_u8.hash(state);
                v.to_bits().hash(state);
            }
            Value::String(v) => {
                5_u8.hash(state);
                v.hash(state);
            }
            Value::Bytes(v) => {
                6_u8.hash(state);
                v.hash(state);
            }
            Value::Object(v) => {
                7_u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Bytes(v) => {
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Object(_) => write!(f, "<object>"),
        }
    }
}

/// Ordered column layout of one result table.
///
/// The first `num_key_columns` columns are group-by key columns; the rest are
/// aggregation intermediate-result columns. The split is stored explicitly and
/// is an invariant of every table that flows through the merge path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    column_names: Vec<String>,
    column_types: Vec<ColumnType>,
    num_key_columns: usize,
}

impl DataSchema {
    /// Builds a schema; `num_key_columns` must not exceed the column count.
    pub fn new(
        column_names: Vec<String>,
        column_types: Vec<ColumnType>,
        num_key_columns: usize,
    ) -> Self {
        assert_eq!(column_names.len(), column_types.len());
        assert!(num_key_columns <= column_names.len());
        Self {
            column_names,
            column_types,
            num_key_columns,
        }
    }

    /// Number of columns.
    pub fn size(&self) -> usize {
        self.column_names.len()
    }

    /// Number of leading key columns.
    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    /// Number of trailing aggregation columns.
    pub fn num_aggregation_columns(&self) -> usize {
        self.column_names.len() - self.num_key_columns
    }

    /// Column name at `index`.
    pub fn column_name(&self, index: usize) -> &str {
        &self.column_names[index]
    }

    /// Column type at `index`.
    pub fn column_type(&self, index: usize) -> ColumnType {
        self.column_types[index]
    }

    /// All column names in order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// All column types in order.
    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    /// Index of the named column, if present.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.column_names.iter().position(|name| name == column)
    }
}

/// Reserved result-table metadata keys.
pub mod metadata_keys {
    /// Total docs across acquired segments, computed before pruning.
    pub const TOTAL_DOCS: &str = "totalDocs";
    /// Docs matched by the filter and scanned post-filter.
    pub const NUM_DOCS_SCANNED: &str = "numDocsScanned";
    /// Entries visited while evaluating the filter.
    pub const NUM_ENTRIES_SCANNED_IN_FILTER: &str = "numEntriesScannedInFilter";
    /// Entries visited while projecting/aggregating matched docs.
    pub const NUM_ENTRIES_SCANNED_POST_FILTER: &str = "numEntriesScannedPostFilter";
    /// Segments whose plan actually executed.
    pub const NUM_SEGMENTS_PROCESSED: &str = "numSegmentsProcessed";
    /// Segments that matched at least one doc.
    pub const NUM_SEGMENTS_MATCHED: &str = "numSegmentsMatched";
    /// Segments named by the request.
    pub const NUM_SEGMENTS_QUERIED: &str = "numSegmentsQueried";
    /// Server-side query processing time.
    pub const TIME_USED_MS: &str = "timeUsedMs";
    /// Consuming (mutable) segments seen by this query.
    pub const NUM_CONSUMING_SEGMENTS_PROCESSED: &str = "numConsumingSegmentsProcessed";
    /// Minimum ingestion freshness across consuming segments.
    pub const MIN_CONSUMING_FRESHNESS_TIME_MS: &str = "minConsumingFreshnessTimeMs";
    /// Serialized trace info, present when tracing was requested.
    pub const TRACE_INFO: &str = "traceInfo";
}

/// Self-describing tabular payload returned by a server.
///
/// A table may be metadata-only (no schema, no rows): pruned-to-empty results
/// and error responses still carry diagnostic metadata and exception entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    /// Column layout; absent for metadata-only tables.
    pub schema: Option<DataSchema>,
    /// Row-major cells, schema-consistent.
    pub rows: Vec<Vec<Value>>,
    /// Diagnostic metadata under the reserved keys.
    pub metadata: BTreeMap<String, String>,
    /// In-band exception entries.
    pub exceptions: Vec<QueryError>,
}

impl DataTable {
    /// Metadata-only empty table.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Empty table with a schema attached.
    pub fn with_schema(schema: DataSchema) -> Self {
        Self {
            schema: Some(schema),
            ..Self::default()
        }
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Appends a row; the caller guarantees schema consistency.
    pub fn add_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Attaches an in-band exception entry.
    pub fn add_exception(&mut self, exception: QueryError) {
        self.exceptions.push(exception);
    }

    /// Sets a metadata entry under a reserved key.
    pub fn set_metadata(&mut self, key: &str, value: impl ToString) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    /// Reads a metadata entry.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(value: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn float_values_hash_by_bits() {
        assert_eq!(
            hash_of(&Value::Double(1.5)),
            hash_of(&Value::Double(1.5))
        );
        assert_ne!(hash_of(&Value::Double(0.0)), hash_of(&Value::Double(-0.0)));
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
    }

    #[test]
    fn numeric_values_compare_across_variants() {
        assert_eq!(
            Value::Int(3).compare(&Value::Double(3.0)),
            Ordering::Equal
        );
        assert_eq!(Value::Long(2).compare(&Value::Double(2.5)), Ordering::Less);
        assert_eq!(Value::Null.compare(&Value::Long(0)), Ordering::Less);
    }

    #[test]
    fn schema_tracks_key_split() {
        let schema = DataSchema::new(
            vec!["city".to_string(), "sum(n)".to_string()],
            vec![ColumnType::String, ColumnType::Double],
            1,
        );
        assert_eq!(schema.num_key_columns(), 1);
        assert_eq!(schema.num_aggregation_columns(), 1);
        assert_eq!(schema.index_of("sum(n)"), Some(1));
    }

    #[test]
    fn data_table_round_trips_through_json() {
        let schema = DataSchema::new(
            vec!["c".to_string()],
            vec![ColumnType::Long],
            0,
        );
        let mut table = DataTable::with_schema(schema);
        table.add_row(vec![Value::Long(42)]);
        table.set_metadata(metadata_keys::TOTAL_DOCS, 42_u64);

        let encoded = serde_json::to_string(&table).expect("encode");
        let decoded: DataTable = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, table);
    }
}
