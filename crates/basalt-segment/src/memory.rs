use std::collections::BTreeMap;

use basalt_common::{ColumnType, Value};

use crate::segment::{DataSource, Dictionary, Segment};

/// In-memory dictionary over a column's distinct values.
#[derive(Debug, Clone)]
pub struct MemoryDictionary {
    values: Vec<Value>,
    sorted: bool,
}

impl Dictionary for MemoryDictionary {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn is_sorted(&self) -> bool {
        self.sorted
    }

    fn min_value(&self) -> Option<Value> {
        if self.sorted {
            self.values.first().cloned()
        } else {
            self.values
                .iter()
                .min_by(|a, b| a.compare(b))
                .cloned()
        }
    }

    fn max_value(&self) -> Option<Value> {
        if self.sorted {
            self.values.last().cloned()
        } else {
            self.values
                .iter()
                .max_by(|a, b| a.compare(b))
                .cloned()
        }
    }
}

/// One in-memory column with its derived metadata.
pub struct MemoryColumn {
    column_type: ColumnType,
    values: Vec<Value>,
    nullable: bool,
    sorted: bool,
    min: Option<Value>,
    max: Option<Value>,
    dictionary: Option<MemoryDictionary>,
}

impl MemoryColumn {
    fn new(column_type: ColumnType, values: Vec<Value>, with_dictionary: bool) -> Self {
        let nullable = values.iter().any(|v| matches!(v, Value::Null));
        let sorted = values
            .windows(2)
            .all(|pair| pair[0].compare(&pair[1]) != std::cmp::Ordering::Greater);
        let min = values
            .iter()
            .filter(|v| !matches!(v, Value::Null))
            .min_by(|a, b| a.compare(b))
            .cloned();
        let max = values
            .iter()
            .filter(|v| !matches!(v, Value::Null))
            .max_by(|a, b| a.compare(b))
            .cloned();
        let dictionary = with_dictionary.then(|| {
            let mut distinct: Vec<Value> = Vec::new();
            for value in &values {
                if !matches!(value, Value::Null) && !distinct.contains(value) {
                    distinct.push(value.clone());
                }
            }
            distinct.sort_by(|a, b| a.compare(b));
            MemoryDictionary {
                values: distinct,
                sorted: true,
            }
        });
        Self {
            column_type,
            values,
            nullable,
            sorted,
            min,
            max,
            dictionary,
        }
    }
}

impl DataSource for MemoryColumn {
    fn column_type(&self) -> ColumnType {
        self.column_type
    }

    fn is_nullable(&self) -> bool {
        self.nullable
    }

    fn is_sorted(&self) -> bool {
        self.sorted
    }

    fn dictionary(&self) -> Option<&dyn Dictionary> {
        self.dictionary.as_ref().map(|d| d as &dyn Dictionary)
    }

    fn min_value(&self) -> Option<Value> {
        self.min.clone()
    }

    fn max_value(&self) -> Option<Value> {
        self.max.clone()
    }

    fn value(&self, row: usize) -> Value {
        self.values[row].clone()
    }
}

/// In-memory segment backing the segment contract.
///
/// Serves as the resident-segment implementation for embedded deployments and
/// as the reference implementation under test.
pub struct MemorySegment {
    name: String,
    total_docs: usize,
    columns: BTreeMap<String, MemoryColumn>,
    mutable: bool,
    last_indexed_timestamp_ms: Option<i64>,
    latest_ingestion_timestamp_ms: Option<i64>,
}

impl Segment for MemorySegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn total_docs(&self) -> usize {
        self.total_docs
    }

    fn is_mutable(&self) -> bool {
        self.mutable
    }

    fn last_indexed_timestamp_ms(&self) -> Option<i64> {
        self.last_indexed_timestamp_ms
    }

    fn latest_ingestion_timestamp_ms(&self) -> Option<i64> {
        self.latest_ingestion_timestamp_ms
    }

    fn data_source(&self, column: &str) -> Option<&dyn DataSource> {
        self.columns.get(column).map(|c| c as &dyn DataSource)
    }
}

/// Builder for [`MemorySegment`].
pub struct MemorySegmentBuilder {
    name: String,
    columns: BTreeMap<String, MemoryColumn>,
    num_rows: Option<usize>,
    mutable: bool,
    last_indexed_timestamp_ms: Option<i64>,
    latest_ingestion_timestamp_ms: Option<i64>,
}

impl MemorySegmentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: BTreeMap::new(),
            num_rows: None,
            mutable: false,
            last_indexed_timestamp_ms: None,
            latest_ingestion_timestamp_ms: None,
        }
    }

    /// Adds a dictionary-encoded column. All columns must have equal length.
    pub fn column(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        values: Vec<Value>,
    ) -> Self {
        self.check_len(values.len());
        self.columns
            .insert(name.into(), MemoryColumn::new(column_type, values, true));
        self
    }

    /// Adds a raw column without a dictionary.
    pub fn raw_column(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        values: Vec<Value>,
    ) -> Self {
        self.check_len(values.len());
        self.columns
            .insert(name.into(), MemoryColumn::new(column_type, values, false));
        self
    }

    /// Marks the segment as still ingesting, with freshness timestamps.
    pub fn mutable(
        mut self,
        last_indexed_timestamp_ms: Option<i64>,
        latest_ingestion_timestamp_ms: Option<i64>,
    ) -> Self {
        self.mutable = true;
        self.last_indexed_timestamp_ms = last_indexed_timestamp_ms;
        self.latest_ingestion_timestamp_ms = latest_ingestion_timestamp_ms;
        self
    }

    pub fn build(self) -> MemorySegment {
        MemorySegment {
            name: self.name,
            total_docs: self.num_rows.unwrap_or(0),
            columns: self.columns,
            mutable: self.mutable,
            last_indexed_timestamp_ms: self.last_indexed_timestamp_ms,
            latest_ingestion_timestamp_ms: self.latest_ingestion_timestamp_ms,
        }
    }

    fn check_len(&mut self, len: usize) {
        match self.num_rows {
            None => self.num_rows = Some(len),
            Some(existing) => assert_eq!(existing, len, "columns must have equal length"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn longs(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Long(*v)).collect()
    }

    #[test]
    fn derives_column_metadata() {
        let segment = MemorySegmentBuilder::new("s0")
            .column("x", ColumnType::Long, longs(&[10, 20, 30, 40]))
            .raw_column("y", ColumnType::Long, longs(&[4, 1, 3, 2]))
            .build();

        assert_eq!(segment.total_docs(), 4);
        let x = segment.data_source("x").expect("x exists");
        assert!(x.is_sorted());
        assert_eq!(x.min_value(), Some(Value::Long(10)));
        assert_eq!(x.max_value(), Some(Value::Long(40)));
        let dictionary = x.dictionary().expect("dictionary");
        assert!(dictionary.is_sorted());
        assert_eq!(dictionary.min_value(), Some(Value::Long(10)));
        assert_eq!(dictionary.max_value(), Some(Value::Long(40)));

        let y = segment.data_source("y").expect("y exists");
        assert!(!y.is_sorted());
        assert!(y.dictionary().is_none());
        assert_eq!(y.value(2), Value::Long(3));
    }

    #[test]
    fn mutable_segments_report_freshness() {
        let segment = MemorySegmentBuilder::new("consuming0")
            .column("x", ColumnType::Long, longs(&[1]))
            .mutable(Some(1_000), Some(2_000))
            .build();
        assert!(segment.is_mutable());
        assert_eq!(segment.last_indexed_timestamp_ms(), Some(1_000));
        assert_eq!(segment.latest_ingestion_timestamp_ms(), Some(2_000));
    }
}
