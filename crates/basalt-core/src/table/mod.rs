//! Bounded concurrent keyed aggregation table.
//!
//! The merge buffer behind group-by execution: per-segment results upsert
//! concurrently from the worker pool, merges run inside per-shard locks, and
//! a stop-the-world trim bounds the table between upserts. The same structure
//! merges per-server tables at the broker.

mod resizer;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use basalt_common::{BasaltError, DataSchema, Result, Value};
use basalt_query::{AggregationFunction, OrderByExpression};
use parking_lot::Mutex;

pub use resizer::TableResizer;

/// Floor for the trim size regardless of the query limit.
pub const DEFAULT_MIN_TRIM_SIZE: usize = 5_000;

const NUM_SHARDS: usize = 16;

/// Size the table returns to after each trim:
/// `max(limit * 5, min_trim_size)`.
pub fn table_trim_size(limit: usize, min_trim_size: usize) -> usize {
    limit.saturating_mul(5).max(min_trim_size)
}

/// Ordered tuple of group-by values; equality and hash are componentwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(pub Vec<Value>);

impl Key {
    /// Stable hash used for sharding and as the order-by tie-break.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Ordered tuple of column values, keys first, then aggregation
/// intermediates.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// The leading key columns as a [`Key`].
    pub fn key(&self, num_key_columns: usize) -> Key {
        Key(self.values[..num_key_columns].to_vec())
    }
}

/// Concurrent bounded mapping from [`Key`] to [`Record`].
///
/// Upserts merge columnwise under the owning shard lock, so readers never see
/// a half-updated record. Once the trim threshold is crossed the table locks
/// every shard, trims back to `trim_to_size` by order-by rank, and resumes.
/// Without an order-by there is no rank to trim by: new keys beyond
/// `trim_to_size` are dropped and counted instead.
pub struct IndexedTable {
    schema: DataSchema,
    functions: Vec<Box<dyn AggregationFunction>>,
    resizer: Option<TableResizer>,
    trim_to_size: usize,
    trim_threshold: usize,
    num_groups_limit: Option<usize>,
    shards: Vec<Mutex<HashMap<Key, Record>>>,
    size: AtomicUsize,
    num_groups_dropped: AtomicU64,
    closed: AtomicBool,
    trim_lock: Mutex<()>,
}

impl IndexedTable {
    /// Builds a table for the given schema and merge functions.
    ///
    /// `order_by` enables rank-based trimming and sorted finish; without it
    /// the table is insertion-bounded. `num_groups_limit` caps distinct keys
    /// ever admitted, independent of trimming.
    pub fn new(
        schema: DataSchema,
        functions: Vec<Box<dyn AggregationFunction>>,
        order_by: Option<&[OrderByExpression]>,
        trim_to_size: usize,
        num_groups_limit: Option<usize>,
    ) -> Result<Self> {
        let resizer = match order_by {
            Some(expressions) if !expressions.is_empty() => {
                Some(TableResizer::new(&schema, &functions, expressions)?)
            }
            _ => None,
        };
        let trim_threshold = trim_to_size.saturating_mul(2).next_power_of_two();
        Ok(Self {
            schema,
            functions,
            resizer,
            trim_to_size,
            trim_threshold,
            num_groups_limit,
            shards: (0..NUM_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            size: AtomicUsize::new(0),
            num_groups_dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            trim_lock: Mutex::new(()),
        })
    }

    /// Current number of groups.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Groups dropped at the admission caps.
    pub fn num_groups_dropped(&self) -> u64 {
        self.num_groups_dropped.load(Ordering::Acquire)
    }

    /// Table schema.
    pub fn schema(&self) -> &DataSchema {
        &self.schema
    }

    /// Size the table returns to after a trim.
    pub fn trim_to_size(&self) -> usize {
        self.trim_to_size
    }

    /// Size beyond which a trim is triggered.
    pub fn trim_threshold(&self) -> usize {
        self.trim_threshold
    }

    /// Inserts a new record or merges into the existing one for its key.
    ///
    /// Safe to call concurrently from the worker pool. After `finish`, late
    /// upserts from abandoned (post-deadline) tasks are silently ignored.
    pub fn upsert(&self, record: Record) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let num_key_columns = self.schema.num_key_columns();
        if record.values.len() != self.schema.size() {
            return Err(BasaltError::Execution(format!(
                "record width {} does not match schema width {}",
                record.values.len(),
                self.schema.size()
            )));
        }
        let key = record.key(num_key_columns);
        let shard = &self.shards[(key.hash_code() as usize) % NUM_SHARDS];

        {
            let mut map = shard.lock();
            if let Some(existing) = map.get_mut(&key) {
                let mut incoming = record.values;
                for (i, function) in self.functions.iter().enumerate() {
                    let column = num_key_columns + i;
                    let left = mem::replace(&mut existing.values[column], Value::Null);
                    let right = mem::replace(&mut incoming[column], Value::Null);
                    existing.values[column] = function.merge(left, right)?;
                }
            } else {
                let size = self.size.load(Ordering::Acquire);
                let at_groups_limit = self
                    .num_groups_limit
                    .map(|limit| size >= limit)
                    .unwrap_or(false);
                let at_unordered_cap = self.resizer.is_none() && size >= self.trim_to_size;
                if at_groups_limit || at_unordered_cap {
                    self.num_groups_dropped.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
                map.insert(key, record);
                self.size.fetch_add(1, Ordering::AcqRel);
            }
        }

        if self.resizer.is_some() && self.size.load(Ordering::Acquire) > self.trim_threshold {
            self.trim()?;
        }
        Ok(())
    }

    /// Stop-the-world trim back to `trim_to_size` by order-by rank.
    fn trim(&self) -> Result<()> {
        let Some(resizer) = &self.resizer else {
            return Ok(());
        };
        let _trim_guard = self.trim_lock.lock();
        if self.size.load(Ordering::Acquire) <= self.trim_threshold {
            return Ok(());
        }
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        let mut combined = HashMap::with_capacity(self.size.load(Ordering::Relaxed));
        for guard in guards.iter_mut() {
            combined.extend(guard.drain());
        }
        resizer.resize_records_map(&mut combined, self.trim_to_size, &self.functions)?;
        let new_size = combined.len();
        for (key, record) in combined {
            let index = (key.hash_code() as usize) % NUM_SHARDS;
            guards[index].insert(key, record);
        }
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }

    /// Closes the table for writes and freezes its contents.
    ///
    /// With `sort` and an order-by, records come back trimmed to
    /// `trim_to_size` in order-by order; otherwise in an unspecified but
    /// stable order.
    pub fn finish(&self, sort: bool) -> Result<FinishedTable> {
        self.closed.store(true, Ordering::Release);
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        let records = match (&self.resizer, sort) {
            (Some(resizer), true) => {
                let mut combined = HashMap::with_capacity(self.size.load(Ordering::Relaxed));
                for guard in guards.iter_mut() {
                    combined.extend(guard.drain());
                }
                resizer.resize_and_sort(combined, self.trim_to_size, &self.functions)?
            }
            _ => {
                let mut records = Vec::with_capacity(self.size.load(Ordering::Relaxed));
                for guard in guards.iter_mut() {
                    records.extend(guard.drain().map(|(_, record)| record));
                }
                records
            }
        };
        self.size.store(0, Ordering::Release);
        Ok(FinishedTable {
            schema: self.schema.clone(),
            records,
            num_groups_dropped: self.num_groups_dropped(),
        })
    }
}

/// Frozen table contents in their final iteration order.
pub struct FinishedTable {
    schema: DataSchema,
    records: Vec<Record>,
    num_groups_dropped: u64,
}

impl FinishedTable {
    pub fn schema(&self) -> &DataSchema {
        &self.schema
    }

    /// Records in the frozen order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consumes the table into its records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn num_groups_dropped(&self) -> u64 {
        self.num_groups_dropped
    }
}
