use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use basalt_common::{BasaltError, DataSchema, Result, Value};
use basalt_query::{AggregationFunction, OrderByExpression};

use super::{Key, Record};

/// Trims and sorts record maps by the query's order-by ranking.
///
/// Records are projected to intermediate records carrying only the order-by
/// columns; an aggregation column whose intermediate is not comparable is
/// final-extracted before comparison, and nowhere else during trimming.
pub struct TableResizer {
    extractors: Vec<OrderByValueExtractor>,
    ascending: Vec<bool>,
}

enum OrderByValueExtractor {
    /// Order-by column is a group-by key column.
    KeyColumn(usize),
    /// Order-by column is an aggregation column.
    AggregationColumn {
        column: usize,
        function: usize,
        extract_final: bool,
    },
}

/// Projection of a record for ranking: the key plus order-by values only.
struct IntermediateRecord {
    key: Key,
    key_hash: u64,
    values: Vec<Value>,
}

impl TableResizer {
    /// Binds order-by expressions to schema columns.
    ///
    /// Relies on the schema invariant that all key columns precede all
    /// aggregation columns.
    pub fn new(
        schema: &DataSchema,
        functions: &[Box<dyn AggregationFunction>],
        order_by: &[OrderByExpression],
    ) -> Result<Self> {
        let num_key_columns = schema.num_key_columns();
        let mut extractors = Vec::with_capacity(order_by.len());
        let mut ascending = Vec::with_capacity(order_by.len());
        for order_by_expression in order_by {
            let column_name = order_by_expression.expression.to_string();
            let index = schema.index_of(&column_name).ok_or_else(|| {
                BasaltError::Execution(format!(
                    "could not find order-by column {column_name} in data schema"
                ))
            })?;
            if index < num_key_columns {
                extractors.push(OrderByValueExtractor::KeyColumn(index));
            } else {
                let function = index - num_key_columns;
                extractors.push(OrderByValueExtractor::AggregationColumn {
                    column: index,
                    function,
                    extract_final: !functions[function].is_intermediate_result_comparable(),
                });
            }
            ascending.push(order_by_expression.ascending);
        }
        Ok(Self {
            extractors,
            ascending,
        })
    }

    fn intermediate_record(
        &self,
        key: &Key,
        record: &Record,
        functions: &[Box<dyn AggregationFunction>],
    ) -> Result<IntermediateRecord> {
        let mut values = Vec::with_capacity(self.extractors.len());
        for extractor in &self.extractors {
            let value = match extractor {
                OrderByValueExtractor::KeyColumn(index) => record.values[*index].clone(),
                OrderByValueExtractor::AggregationColumn {
                    column,
                    function,
                    extract_final,
                } => {
                    let raw = record.values[*column].clone();
                    if *extract_final {
                        functions[*function].extract_final_result(raw)?
                    } else {
                        raw
                    }
                }
            };
            values.push(value);
        }
        Ok(IntermediateRecord {
            key: key.clone(),
            key_hash: key.hash_code(),
            values,
        })
    }

    /// Presentation order: order-by columns in sequence, key hash as the
    /// deterministic tie-break.
    fn compare(&self, left: &IntermediateRecord, right: &IntermediateRecord) -> Ordering {
        for (i, ascending) in self.ascending.iter().enumerate() {
            let ordering = left.values[i].compare(&right.values[i]);
            let ordering = if *ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.key_hash.cmp(&right.key_hash)
    }

    /// Trims the map to `trim_to_size`, choosing the cheaper heap: the worst
    /// records when few must go, the best records when few survive.
    pub fn resize_records_map(
        &self,
        records: &mut HashMap<Key, Record>,
        trim_to_size: usize,
        functions: &[Box<dyn AggregationFunction>],
    ) -> Result<()> {
        let num_to_evict = records.len().saturating_sub(trim_to_size);
        if num_to_evict == 0 {
            return Ok(());
        }
        if num_to_evict < trim_to_size {
            let mut heap = BoundedHeap::new(num_to_evict, |a, b| self.compare(a, b));
            for (key, record) in records.iter() {
                heap.offer(self.intermediate_record(key, record, functions)?);
            }
            for evicted in heap.into_entries() {
                records.remove(&evicted.key);
            }
        } else {
            let mut heap = BoundedHeap::new(trim_to_size, |a, b| self.compare(b, a));
            for (key, record) in records.iter() {
                heap.offer(self.intermediate_record(key, record, functions)?);
            }
            let keys_to_retain: HashSet<Key> = heap
                .into_entries()
                .into_iter()
                .map(|retained| retained.key)
                .collect();
            records.retain(|key, _| keys_to_retain.contains(key));
        }
        Ok(())
    }

    /// Trims to `trim_to_size` and returns records in presentation order.
    ///
    /// When the retain heap is the cheaper side it doubles as the sorter:
    /// draining it fills a reverse-indexed array, avoiding a second sort
    /// pass.
    pub fn resize_and_sort(
        &self,
        mut records: HashMap<Key, Record>,
        trim_to_size: usize,
        functions: &[Box<dyn AggregationFunction>],
    ) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let num_to_retain = records.len().min(trim_to_size);
        let num_to_evict = records.len() - num_to_retain;

        if num_to_evict < num_to_retain {
            if num_to_evict > 0 {
                let mut heap = BoundedHeap::new(num_to_evict, |a, b| self.compare(a, b));
                for (key, record) in records.iter() {
                    heap.offer(self.intermediate_record(key, record, functions)?);
                }
                for evicted in heap.into_entries() {
                    records.remove(&evicted.key);
                }
            }
            let mut intermediates = Vec::with_capacity(records.len());
            for (key, record) in records.iter() {
                intermediates.push(self.intermediate_record(key, record, functions)?);
            }
            intermediates.sort_by(|a, b| self.compare(a, b));
            let mut sorted = Vec::with_capacity(intermediates.len());
            for intermediate in intermediates {
                if let Some(record) = records.remove(&intermediate.key) {
                    sorted.push(record);
                }
            }
            Ok(sorted)
        } else {
            let mut heap = BoundedHeap::new(num_to_retain, |a, b| self.compare(b, a));
            for (key, record) in records.iter() {
                heap.offer(self.intermediate_record(key, record, functions)?);
            }
            let mut sorted: Vec<Option<Record>> = Vec::new();
            sorted.resize_with(num_to_retain, || None);
            let mut index = num_to_retain;
            while let Some(worst_remaining) = heap.pop() {
                index -= 1;
                sorted[index] = records.remove(&worst_remaining.key);
            }
            Ok(sorted.into_iter().flatten().collect())
        }
    }
}

/// Fixed-capacity selection heap: retains the `capacity` greatest entries
/// under the comparator, with the least retained entry at the root.
struct BoundedHeap<F>
where
    F: Fn(&IntermediateRecord, &IntermediateRecord) -> Ordering,
{
    entries: Vec<IntermediateRecord>,
    capacity: usize,
    cmp: F,
}

impl<F> BoundedHeap<F>
where
    F: Fn(&IntermediateRecord, &IntermediateRecord) -> Ordering,
{
    fn new(capacity: usize, cmp: F) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            cmp,
        }
    }

    fn offer(&mut self, entry: IntermediateRecord) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            self.sift_up(self.entries.len() - 1);
        } else if (self.cmp)(&self.entries[0], &entry) == Ordering::Less {
            self.entries[0] = entry;
            self.sift_down(0);
        }
    }

    fn pop(&mut self) -> Option<IntermediateRecord> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let popped = self.entries.pop();
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        popped
    }

    fn into_entries(self) -> Vec<IntermediateRecord> {
        self.entries
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if (self.cmp)(&self.entries[index], &self.entries[parent]) == Ordering::Less {
                self.entries.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;
            if left < self.entries.len()
                && (self.cmp)(&self.entries[left], &self.entries[smallest]) == Ordering::Less
            {
                smallest = left;
            }
            if right < self.entries.len()
                && (self.cmp)(&self.entries[right], &self.entries[smallest]) == Ordering::Less
            {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.entries.swap(index, smallest);
            index = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::ColumnType;
    use basalt_query::{from_function, Expression, FunctionCall, FunctionKind};

    fn schema() -> DataSchema {
        DataSchema::new(
            vec![
                "city".to_string(),
                "sum(n)".to_string(),
                "avg(n)".to_string(),
            ],
            vec![ColumnType::String, ColumnType::Double, ColumnType::Object],
            1,
        )
    }

    fn functions() -> Vec<Box<dyn AggregationFunction>> {
        let sum = FunctionCall {
            kind: FunctionKind::Aggregation,
            name: "sum".to_string(),
            arguments: vec![Expression::identifier("n")],
        };
        let avg = FunctionCall {
            kind: FunctionKind::Aggregation,
            name: "avg".to_string(),
            arguments: vec![Expression::identifier("n")],
        };
        vec![from_function(&sum).unwrap(), from_function(&avg).unwrap()]
    }

    fn records(n: usize) -> HashMap<Key, Record> {
        use basalt_common::ObjectValue;
        (0..n)
            .map(|i| {
                let record = Record::new(vec![
                    Value::String(format!("city{i}")),
                    Value::Double(i as f64),
                    Value::Object(ObjectValue::AvgPair {
                        sum: (n - i) as f64,
                        count: 1,
                    }),
                ]);
                (record.key(1), record)
            })
            .collect()
    }

    fn resizer(order_by: Vec<OrderByExpression>) -> TableResizer {
        TableResizer::new(&schema(), &functions(), &order_by).unwrap()
    }

    fn sum_desc() -> Vec<OrderByExpression> {
        vec![OrderByExpression::desc(Expression::aggregation(
            "sum",
            vec![Expression::identifier("n")],
        ))]
    }

    #[test]
    fn evict_heap_path_keeps_best_records() {
        // 10 records, trim to 8: evict heap (2 < 8).
        let mut map = records(10);
        resizer(sum_desc())
            .resize_records_map(&mut map, 8, &functions())
            .unwrap();
        assert_eq!(map.len(), 8);
        for i in 2..10 {
            assert!(map.contains_key(&Key(vec![Value::String(format!("city{i}"))])));
        }
    }

    #[test]
    fn retain_heap_path_keeps_best_records() {
        // 10 records, trim to 3: retain heap (7 >= 3).
        let mut map = records(10);
        resizer(sum_desc())
            .resize_records_map(&mut map, 3, &functions())
            .unwrap();
        assert_eq!(map.len(), 3);
        for i in 7..10 {
            assert!(map.contains_key(&Key(vec![Value::String(format!("city{i}"))])));
        }
    }

    #[test]
    fn resize_and_sort_returns_presentation_order() {
        let sorted = resizer(sum_desc())
            .resize_and_sort(records(10), 3, &functions())
            .unwrap();
        let sums: Vec<Value> = sorted.iter().map(|r| r.values[1].clone()).collect();
        assert_eq!(
            sums,
            vec![Value::Double(9.0), Value::Double(8.0), Value::Double(7.0)]
        );

        // Evict-then-sort side of the split.
        let sorted = resizer(sum_desc())
            .resize_and_sort(records(10), 8, &functions())
            .unwrap();
        assert_eq!(sorted.len(), 8);
        assert_eq!(sorted[0].values[1], Value::Double(9.0));
        assert_eq!(sorted[7].values[1], Value::Double(2.0));
    }

    #[test]
    fn non_comparable_intermediates_rank_by_final_result() {
        // avg intermediate is an object; ranking must use the extracted
        // final value, which decreases as i grows.
        let order_by = vec![OrderByExpression::desc(Expression::aggregation(
            "avg",
            vec![Expression::identifier("n")],
        ))];
        let sorted = resizer(order_by)
            .resize_and_sort(records(10), 2, &functions())
            .unwrap();
        assert_eq!(sorted[0].values[0], Value::String("city0".to_string()));
        assert_eq!(sorted[1].values[0], Value::String("city1".to_string()));
    }

    #[test]
    fn key_column_order_by_with_tie_break_is_deterministic() {
        let order_by = vec![OrderByExpression::asc(Expression::identifier("city"))];
        let resizer = resizer(order_by);
        let first = resizer
            .resize_and_sort(records(10), 10, &functions())
            .unwrap();
        let second = resizer
            .resize_and_sort(records(10), 10, &functions())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].values[0], Value::String("city0".to_string()));
    }

    #[test]
    fn small_maps_are_left_alone() {
        let mut map = records(3);
        resizer(sum_desc())
            .resize_records_map(&mut map, 8, &functions())
            .unwrap();
        assert_eq!(map.len(), 3);
    }
}
