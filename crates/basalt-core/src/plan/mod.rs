//! Plan-node variants and deadline-bound execution.
//!
//! A plan is a tree: one leaf per surviving segment, a combine node that runs
//! leaves on the worker pool and merges their blocks, and an instance-response
//! node framing the final table. Plans are single-use; `execute` consumes the
//! node.
//!
//! Deadline semantics:
//! - the combine node collects child results with an absolute deadline;
//! - when it passes, the shared deadline flag is raised, outstanding children
//!   abandon work at their next block boundary, and the partial result carries
//!   a deadline exception in-band.

pub mod maker;

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use basalt_common::data::metadata_keys;
use basalt_common::metrics::global_metrics;
use basalt_common::{
    BasaltError, ColumnType, DataSchema, DataTable, ObjectValue, QueryError, QueryErrorCode,
    Result, Value,
};
use basalt_query::aggregation::aggregation_functions_for_query;
use basalt_query::legacy::GROUP_KEY_DELIMITER;
use basalt_query::{AggregationFunction, Expression, FilterContext, QueryContext, QueryOptions};
use basalt_segment::Segment;
use tracing::{debug, error, info};

use crate::exec::{self, ScanStatistics};
use crate::pool::WorkerPool;
use crate::response::StreamObserver;
use crate::table::{table_trim_size, IndexedTable, Key, Record};
use crate::timer::current_time_ms;

/// Rows examined between deadline checks.
const SCAN_BLOCK_SIZE: usize = 10_000;

/// Column names of the legacy group-by block layout.
const LEGACY_FUNCTION_COLUMN: &str = "aggregation";
const LEGACY_GROUP_MAP_COLUMN: &str = "groupByResultMap";

/// Shared absolute deadline for one plan execution.
///
/// Child tasks poll `is_expired` at block granularity; the combine node
/// raises the flag when its collection window closes so abandoned children
/// stop promptly.
pub struct DeadlineSignal {
    end_time_ms: u64,
    expired: AtomicBool,
}

impl DeadlineSignal {
    pub fn new(end_time_ms: u64) -> Self {
        Self {
            end_time_ms,
            expired: AtomicBool::new(false),
        }
    }

    /// Raises the flag; children observe it at the next block boundary.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::Release);
    }

    /// Whether the deadline has passed or been raised.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire) || current_time_ms() >= self.end_time_ms
    }

    /// Time left before the absolute deadline.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.end_time_ms.saturating_sub(current_time_ms()))
    }
}

/// One leaf plan's result block.
pub struct SegmentResult {
    /// Result block of this segment.
    pub table: DataTable,
    /// Scan counters.
    pub stats: ScanStatistics,
    /// Whether the segment's rows were actually processed (scan paths).
    pub processed: bool,
    /// Whether at least one doc matched.
    pub matched: bool,
    /// Groups dropped at this segment's admission cap.
    pub num_groups_dropped: u64,
}

impl SegmentResult {
    fn new(table: DataTable, stats: ScanStatistics) -> Self {
        let matched = stats.num_docs_scanned > 0;
        Self {
            table,
            stats,
            processed: true,
            matched,
            num_groups_dropped: 0,
        }
    }

    fn metadata_only(table: DataTable) -> Self {
        Self {
            table,
            stats: ScanStatistics::default(),
            processed: false,
            matched: false,
            num_groups_dropped: 0,
        }
    }
}

/// Selection leaf: filtered scan with projection, bounded by the limit.
pub struct SelectionPlan {
    pub segment: Arc<dyn Segment>,
    pub query: Arc<QueryContext>,
}

/// Aggregation-only leaf: filtered scan folding into one intermediate row.
pub struct AggregationPlan {
    pub segment: Arc<dyn Segment>,
    pub query: Arc<QueryContext>,
}

/// Legacy group-by leaf: per-aggregation group maps keyed by joined strings.
pub struct AggregationGroupByPlan {
    pub segment: Arc<dyn Segment>,
    pub query: Arc<QueryContext>,
    pub max_initial_result_holder_capacity: usize,
    pub num_groups_limit: usize,
}

/// Ordered group-by leaf: keyed records with intermediate columns.
pub struct AggregationGroupByOrderByPlan {
    pub segment: Arc<dyn Segment>,
    pub query: Arc<QueryContext>,
    pub max_initial_result_holder_capacity: usize,
    pub num_groups_limit: usize,
}

/// Metadata-only leaf: answers `count()` from segment metadata.
pub struct MetadataAggregationPlan {
    pub segment: Arc<dyn Segment>,
    pub query: Arc<QueryContext>,
}

/// Dictionary-only leaf: answers min/max endpoints from a sorted dictionary.
pub struct DictionaryAggregationPlan {
    pub segment: Arc<dyn Segment>,
    pub query: Arc<QueryContext>,
}

/// Parallelizing merge node over the leaf plans.
pub struct CombinePlan {
    pub children: Vec<PlanNode>,
    pub query: Arc<QueryContext>,
    pub pool: Arc<WorkerPool>,
    pub table_name: String,
    pub end_time_ms: u64,
    pub max_initial_result_holder_capacity: usize,
    pub num_groups_limit: usize,
    pub observer: Option<Arc<dyn StreamObserver>>,
}

/// Response-framing root over the combine node.
pub struct InstanceResponsePlan {
    pub combine: CombinePlan,
}

/// The physical plan-node tree.
pub enum PlanNode {
    Selection(SelectionPlan),
    Aggregation(AggregationPlan),
    AggregationGroupBy(AggregationGroupByPlan),
    AggregationGroupByOrderBy(AggregationGroupByOrderByPlan),
    MetadataAggregation(MetadataAggregationPlan),
    DictionaryAggregation(DictionaryAggregationPlan),
    Combine(CombinePlan),
    InstanceResponse(InstanceResponsePlan),
}

impl PlanNode {
    /// Operator name for logs and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanNode::Selection(_) => "Selection",
            PlanNode::Aggregation(_) => "Aggregation",
            PlanNode::AggregationGroupBy(_) => "AggregationGroupBy",
            PlanNode::AggregationGroupByOrderBy(_) => "AggregationGroupByOrderBy",
            PlanNode::MetadataAggregation(_) => "MetadataAggregation",
            PlanNode::DictionaryAggregation(_) => "DictionaryAggregation",
            PlanNode::Combine(_) => "Combine",
            PlanNode::InstanceResponse(_) => "InstanceResponse",
        }
    }

    /// The bound segment, for leaf nodes.
    pub fn segment(&self) -> Option<&Arc<dyn Segment>> {
        match self {
            PlanNode::Selection(plan) => Some(&plan.segment),
            PlanNode::Aggregation(plan) => Some(&plan.segment),
            PlanNode::AggregationGroupBy(plan) => Some(&plan.segment),
            PlanNode::AggregationGroupByOrderBy(plan) => Some(&plan.segment),
            PlanNode::MetadataAggregation(plan) => Some(&plan.segment),
            PlanNode::DictionaryAggregation(plan) => Some(&plan.segment),
            PlanNode::Combine(_) | PlanNode::InstanceResponse(_) => None,
        }
    }

    /// Uniform execute contract. Plans are single-use.
    pub fn execute(self, deadline: Arc<DeadlineSignal>) -> Result<DataTable> {
        match self {
            PlanNode::Combine(plan) => plan.execute(deadline),
            PlanNode::InstanceResponse(plan) => plan.combine.execute(deadline),
            leaf => leaf.execute_segment(&deadline).map(|result| result.table),
        }
    }

    /// Executes a leaf against its segment.
    fn execute_segment(self, deadline: &DeadlineSignal) -> Result<SegmentResult> {
        match self {
            PlanNode::Selection(plan) => execute_selection(plan, deadline),
            PlanNode::Aggregation(plan) => execute_aggregation(plan, deadline),
            PlanNode::AggregationGroupBy(plan) => execute_group_by_legacy(plan, deadline),
            PlanNode::AggregationGroupByOrderBy(plan) => {
                execute_group_by_order_by(plan, deadline)
            }
            PlanNode::MetadataAggregation(plan) => execute_metadata_aggregation(plan),
            PlanNode::DictionaryAggregation(plan) => execute_dictionary_aggregation(plan),
            PlanNode::Combine(_) | PlanNode::InstanceResponse(_) => Err(BasaltError::Execution(
                "combine and instance-response nodes are not segment plans".to_string(),
            )),
        }
    }
}

impl InstanceResponsePlan {
    /// Executes the whole plan under its absolute deadline.
    pub fn execute(self) -> Result<DataTable> {
        let deadline = Arc::new(DeadlineSignal::new(self.combine.end_time_ms));
        self.combine.execute(deadline)
    }
}

/// Merge behavior of the combine node, derived from the query shape.
enum CombineShape {
    Selection,
    AggregationOnly,
    GroupByLegacy,
    GroupByOrderBy,
}

fn combine_shape(query: &QueryContext) -> CombineShape {
    if !query.is_aggregation_query() {
        return CombineShape::Selection;
    }
    if query.group_by_expressions.is_none() {
        return CombineShape::AggregationOnly;
    }
    if QueryOptions::new(&query.query_options).is_group_by_mode_sql() {
        CombineShape::GroupByOrderBy
    } else {
        CombineShape::GroupByLegacy
    }
}

impl CombinePlan {
    fn execute(self, deadline: Arc<DeadlineSignal>) -> Result<DataTable> {
        let CombinePlan {
            children,
            query,
            pool,
            table_name,
            end_time_ms,
            max_initial_result_holder_capacity,
            num_groups_limit,
            observer,
        } = self;
        if children.is_empty() {
            return Err(BasaltError::Execution(
                "combine node needs at least one child".to_string(),
            ));
        }
        let shape = combine_shape(&query);

        // The ordered group-by pipeline merges into one shared table directly
        // from the worker tasks.
        let shared_table = match shape {
            CombineShape::GroupByOrderBy => {
                let segment = children[0].segment().ok_or_else(|| {
                    BasaltError::Execution("combine children must be segment plans".to_string())
                })?;
                let functions = aggregation_functions_for_query(&query)?;
                let schema = group_by_schema(segment.as_ref(), &query, &functions)?;
                let trim_to_size =
                    table_trim_size(query.limit, max_initial_result_holder_capacity);
                Some(Arc::new(IndexedTable::new(
                    schema,
                    functions,
                    query.order_by_expressions.as_deref(),
                    trim_to_size,
                    Some(num_groups_limit),
                )?))
            }
            _ => None,
        };

        let (tx, rx) = mpsc::channel::<Result<SegmentResult>>();
        let num_children = children.len();
        for child in children {
            let tx = tx.clone();
            let deadline = Arc::clone(&deadline);
            let shared_table = shared_table.clone();
            pool.spawn(move || {
                let outcome = child.execute_segment(&deadline).and_then(|mut leaf| {
                    if let Some(table) = shared_table {
                        let rows = mem::take(&mut leaf.table.rows);
                        for row in rows {
                            table.upsert(Record::new(row))?;
                        }
                    }
                    Ok(leaf)
                });
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        let mut collected: Vec<SegmentResult> = Vec::with_capacity(num_children);
        let mut child_error: Option<BasaltError> = None;
        let mut num_received = 0;
        let mut timed_out = false;
        while num_received < num_children {
            match rx.recv_timeout(deadline.remaining()) {
                Ok(outcome) => {
                    num_received += 1;
                    match outcome {
                        Ok(leaf) => {
                            if let Some(observer) = &observer {
                                observer.on_data(&leaf.table)?;
                            }
                            collected.push(leaf);
                        }
                        Err(error) => {
                            // Partial results beat full failure: the
                            // remaining children keep merging and the first
                            // error rides along as an in-band exception.
                            if child_error.is_none() {
                                child_error = Some(error);
                            }
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    deadline.expire();
                    timed_out = true;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut leaf_dropped: u64 = collected.iter().map(|leaf| leaf.num_groups_dropped).sum();
        let mut data_table = match shape {
            CombineShape::Selection => {
                if observer.is_some() {
                    // Data already streamed; close with a metadata-only table.
                    DataTable::empty()
                } else {
                    merge_selection(&query, &mut collected)?
                }
            }
            CombineShape::AggregationOnly => merge_aggregation(&query, &collected)?,
            CombineShape::GroupByOrderBy => {
                let Some(table) = shared_table else {
                    return Err(BasaltError::Execution(
                        "ordered group-by combine lost its table".to_string(),
                    ));
                };
                let finished = table.finish(true)?;
                leaf_dropped += finished.num_groups_dropped();
                let mut out = DataTable::with_schema(finished.schema().clone());
                for record in finished.into_records() {
                    out.add_row(record.values);
                }
                out
            }
            CombineShape::GroupByLegacy => {
                let (out, dropped) =
                    merge_group_by_legacy(&query, &mut collected, num_groups_limit)?;
                leaf_dropped += dropped;
                out
            }
        };

        if leaf_dropped > 0 {
            global_metrics().add_groups_limit_drops(&table_name, leaf_dropped);
            debug!(table = %table_name, dropped = leaf_dropped, "groups dropped at limit");
        }

        let mut stats = ScanStatistics::default();
        for leaf in &collected {
            stats.merge(&leaf.stats);
        }
        let num_processed = collected.iter().filter(|leaf| leaf.processed).count();
        let num_matched = collected.iter().filter(|leaf| leaf.matched).count();
        data_table.set_metadata(metadata_keys::NUM_DOCS_SCANNED, stats.num_docs_scanned);
        data_table.set_metadata(
            metadata_keys::NUM_ENTRIES_SCANNED_IN_FILTER,
            stats.num_entries_scanned_in_filter,
        );
        data_table.set_metadata(
            metadata_keys::NUM_ENTRIES_SCANNED_POST_FILTER,
            stats.num_entries_scanned_post_filter,
        );
        data_table.set_metadata(metadata_keys::NUM_SEGMENTS_PROCESSED, num_processed);
        data_table.set_metadata(metadata_keys::NUM_SEGMENTS_MATCHED, num_matched);

        if let Some(error) = child_error {
            global_metrics().inc_query_execution_exceptions(&table_name);
            match &error {
                BasaltError::BadQuery(_) => {
                    info!(table = %table_name, %error, "caught bad query request in segment plan")
                }
                _ => error!(table = %table_name, %error, "segment plan execution failed"),
            }
            data_table.add_exception(QueryError::new(
                QueryErrorCode::QueryExecution,
                error.to_string(),
            ));
        }

        if timed_out {
            data_table.add_exception(QueryError::new(
                QueryErrorCode::QueryExecution,
                format!(
                    "deadline of {end_time_ms}ms passed with {} of {num_children} segments combined",
                    collected.len()
                ),
            ));
        }
        Ok(data_table)
    }
}

/// Walks matching rows in deadline-checked blocks.
///
/// `visit` returns whether the scan should continue.
fn for_each_matching_row(
    segment: &dyn Segment,
    filter: Option<&FilterContext>,
    deadline: &DeadlineSignal,
    stats: &mut ScanStatistics,
    mut visit: impl FnMut(usize, &mut ScanStatistics) -> Result<bool>,
) -> Result<()> {
    let total_docs = segment.total_docs();
    let mut row = 0;
    while row < total_docs {
        if deadline.is_expired() {
            break;
        }
        let block_end = (row + SCAN_BLOCK_SIZE).min(total_docs);
        while row < block_end {
            let matched = match filter {
                Some(filter) => exec::filter_matches(segment, filter, row, stats)?,
                None => true,
            };
            if matched {
                stats.num_docs_scanned += 1;
                if !visit(row, stats)? {
                    return Ok(());
                }
            }
            row += 1;
        }
    }
    Ok(())
}

fn execute_selection(plan: SelectionPlan, deadline: &DeadlineSignal) -> Result<SegmentResult> {
    let SelectionPlan { segment, query } = plan;
    let mut column_names = Vec::with_capacity(query.select_expressions.len());
    let mut column_types = Vec::with_capacity(query.select_expressions.len());
    for expression in &query.select_expressions {
        column_names.push(expression.to_string());
        column_types.push(exec::expression_column_type(segment.as_ref(), expression)?);
    }
    let schema = DataSchema::new(column_names, column_types, 0);

    let mut stats = ScanStatistics::default();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    let limit = query.limit;
    for_each_matching_row(
        segment.as_ref(),
        query.filter.as_ref(),
        deadline,
        &mut stats,
        |row, stats| {
            let mut out = Vec::with_capacity(query.select_expressions.len());
            for expression in &query.select_expressions {
                out.push(exec::evaluate(segment.as_ref(), expression, row)?);
                stats.num_entries_scanned_post_filter += 1;
            }
            rows.push(out);
            Ok(rows.len() < limit)
        },
    )?;

    let mut table = DataTable::with_schema(schema);
    table.rows = rows;
    Ok(SegmentResult::new(table, stats))
}

fn execute_aggregation(plan: AggregationPlan, deadline: &DeadlineSignal) -> Result<SegmentResult> {
    let AggregationPlan { segment, query } = plan;
    let functions = aggregation_functions_for_query(&query)?;
    let mut states: Vec<Value> = functions.iter().map(|function| function.init()).collect();

    let mut stats = ScanStatistics::default();
    for_each_matching_row(
        segment.as_ref(),
        query.filter.as_ref(),
        deadline,
        &mut stats,
        |row, stats| {
            for (function, state) in functions.iter().zip(states.iter_mut()) {
                let input = match function.input_expressions().first() {
                    Some(expression) => exec::evaluate(segment.as_ref(), expression, row)?,
                    None => Value::Null,
                };
                stats.num_entries_scanned_post_filter += function.input_expressions().len() as u64;
                function.accept(state, &input)?;
            }
            Ok(true)
        },
    )?;

    let mut table = DataTable::with_schema(aggregation_schema(&functions));
    table.add_row(states);
    Ok(SegmentResult::new(table, stats))
}

fn execute_metadata_aggregation(plan: MetadataAggregationPlan) -> Result<SegmentResult> {
    let MetadataAggregationPlan { segment, query } = plan;
    let functions = aggregation_functions_for_query(&query)?;
    let total_docs = segment.total_docs() as i64;
    let row = vec![Value::Long(total_docs); functions.len()];
    let mut table = DataTable::with_schema(aggregation_schema(&functions));
    table.add_row(row);
    Ok(SegmentResult::metadata_only(table))
}

fn execute_dictionary_aggregation(plan: DictionaryAggregationPlan) -> Result<SegmentResult> {
    let DictionaryAggregationPlan { segment, query } = plan;
    let functions = aggregation_functions_for_query(&query)?;
    let mut row = Vec::with_capacity(query.select_expressions.len());
    for expression in &query.select_expressions {
        let Some(call) = expression.function() else {
            return Err(BasaltError::Execution(format!(
                "dictionary plan over a non-function expression: {expression}"
            )));
        };
        let Some(Expression::Identifier(column)) = call.arguments.first() else {
            return Err(BasaltError::Execution(format!(
                "dictionary plan needs an identifier argument: {call}"
            )));
        };
        let dictionary = segment
            .data_source(column)
            .and_then(|data_source| data_source.dictionary())
            .ok_or_else(|| {
                BasaltError::Execution(format!("dictionary plan over column {column} without one"))
            })?;
        let min = dictionary
            .min_value()
            .and_then(|value| value.as_f64())
            .unwrap_or(f64::INFINITY);
        let max = dictionary
            .max_value()
            .and_then(|value| value.as_f64())
            .unwrap_or(f64::NEG_INFINITY);
        row.push(match call.name.as_str() {
            "min" => Value::Double(min),
            "max" => Value::Double(max),
            "minmaxrange" => Value::Object(ObjectValue::MinMaxPair { min, max }),
            other => {
                return Err(BasaltError::Execution(format!(
                    "dictionary plan cannot answer {other}"
                )))
            }
        });
    }
    let mut table = DataTable::with_schema(aggregation_schema(&functions));
    table.add_row(row);
    Ok(SegmentResult::metadata_only(table))
}

fn execute_group_by_legacy(
    plan: AggregationGroupByPlan,
    deadline: &DeadlineSignal,
) -> Result<SegmentResult> {
    let AggregationGroupByPlan {
        segment,
        query,
        max_initial_result_holder_capacity: _,
        num_groups_limit,
    } = plan;
    let functions = aggregation_functions_for_query(&query)?;
    let group_by = query.group_by_expressions.clone().ok_or_else(|| {
        BasaltError::Execution("group-by plan without group-by expressions".to_string())
    })?;
    let mut group_maps: Vec<BTreeMap<String, Value>> = functions
        .iter()
        .map(|_| BTreeMap::new())
        .collect();
    let mut num_groups_dropped = 0_u64;

    let mut stats = ScanStatistics::default();
    for_each_matching_row(
        segment.as_ref(),
        query.filter.as_ref(),
        deadline,
        &mut stats,
        |row, stats| {
            let mut parts = Vec::with_capacity(group_by.len());
            for expression in &group_by {
                parts.push(exec::evaluate(segment.as_ref(), expression, row)?.to_string());
                stats.num_entries_scanned_post_filter += 1;
            }
            let group_key = parts.join(&GROUP_KEY_DELIMITER.to_string());
            if !group_maps[0].contains_key(&group_key) && group_maps[0].len() >= num_groups_limit
            {
                num_groups_dropped += 1;
                return Ok(true);
            }
            for (function, map) in functions.iter().zip(group_maps.iter_mut()) {
                let input = match function.input_expressions().first() {
                    Some(expression) => exec::evaluate(segment.as_ref(), expression, row)?,
                    None => Value::Null,
                };
                stats.num_entries_scanned_post_filter += function.input_expressions().len() as u64;
                let state = map
                    .entry(group_key.clone())
                    .or_insert_with(|| function.init());
                function.accept(state, &input)?;
            }
            Ok(true)
        },
    )?;

    let mut table = DataTable::with_schema(legacy_group_by_schema());
    for (function, map) in functions.iter().zip(group_maps) {
        table.add_row(vec![
            Value::String(function.result_column_name()),
            Value::Object(ObjectValue::GroupMap(map)),
        ]);
    }
    let mut result = SegmentResult::new(table, stats);
    result.num_groups_dropped = num_groups_dropped;
    Ok(result)
}

fn execute_group_by_order_by(
    plan: AggregationGroupByOrderByPlan,
    deadline: &DeadlineSignal,
) -> Result<SegmentResult> {
    let AggregationGroupByOrderByPlan {
        segment,
        query,
        max_initial_result_holder_capacity,
        num_groups_limit,
    } = plan;
    let functions = aggregation_functions_for_query(&query)?;
    let schema = group_by_schema(segment.as_ref(), &query, &functions)?;
    let group_by = query.group_by_expressions.clone().ok_or_else(|| {
        BasaltError::Execution("group-by plan without group-by expressions".to_string())
    })?;

    let mut holder: HashMap<Key, Vec<Value>> =
        HashMap::with_capacity(max_initial_result_holder_capacity.min(num_groups_limit));
    let mut num_groups_dropped = 0_u64;

    let mut stats = ScanStatistics::default();
    for_each_matching_row(
        segment.as_ref(),
        query.filter.as_ref(),
        deadline,
        &mut stats,
        |row, stats| {
            let mut key_values = Vec::with_capacity(group_by.len());
            for expression in &group_by {
                key_values.push(exec::evaluate(segment.as_ref(), expression, row)?);
                stats.num_entries_scanned_post_filter += 1;
            }
            let key = Key(key_values);
            let holder_len = holder.len();
            let states = match holder.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    if holder_len >= num_groups_limit {
                        num_groups_dropped += 1;
                        return Ok(true);
                    }
                    entry.insert(functions.iter().map(|function| function.init()).collect())
                }
            };
            for (function, state) in functions.iter().zip(states.iter_mut()) {
                let input = match function.input_expressions().first() {
                    Some(expression) => exec::evaluate(segment.as_ref(), expression, row)?,
                    None => Value::Null,
                };
                stats.num_entries_scanned_post_filter += function.input_expressions().len() as u64;
                function.accept(state, &input)?;
            }
            Ok(true)
        },
    )?;

    let mut table = DataTable::with_schema(schema);
    for (key, states) in holder {
        let mut row = key.0;
        row.extend(states);
        table.add_row(row);
    }
    let mut result = SegmentResult::new(table, stats);
    result.num_groups_dropped = num_groups_dropped;
    Ok(result)
}

/// Schema of the ordered group-by block: key columns first, then aggregation
/// intermediate columns.
pub(crate) fn group_by_schema(
    segment: &dyn Segment,
    query: &QueryContext,
    functions: &[Box<dyn AggregationFunction>],
) -> Result<DataSchema> {
    let group_by = query.group_by_expressions.as_ref().ok_or_else(|| {
        BasaltError::Execution("group-by schema without group-by expressions".to_string())
    })?;
    let mut column_names = Vec::with_capacity(group_by.len() + functions.len());
    let mut column_types = Vec::with_capacity(group_by.len() + functions.len());
    for expression in group_by {
        column_names.push(expression.to_string());
        column_types.push(exec::expression_column_type(segment, expression)?);
    }
    for function in functions {
        column_names.push(function.result_column_name());
        column_types.push(function.intermediate_result_column_type());
    }
    Ok(DataSchema::new(column_names, column_types, group_by.len()))
}

fn aggregation_schema(functions: &[Box<dyn AggregationFunction>]) -> DataSchema {
    DataSchema::new(
        functions
            .iter()
            .map(|function| function.result_column_name())
            .collect(),
        functions
            .iter()
            .map(|function| function.intermediate_result_column_type())
            .collect(),
        0,
    )
}

fn legacy_group_by_schema() -> DataSchema {
    DataSchema::new(
        vec![
            LEGACY_FUNCTION_COLUMN.to_string(),
            LEGACY_GROUP_MAP_COLUMN.to_string(),
        ],
        vec![ColumnType::String, ColumnType::Object],
        0,
    )
}

fn merge_selection(
    query: &QueryContext,
    collected: &mut Vec<SegmentResult>,
) -> Result<DataTable> {
    let Some(first) = collected.first() else {
        return Ok(DataTable::empty());
    };
    let Some(schema) = first.table.schema.clone() else {
        return Err(BasaltError::Execution(
            "selection block without a schema".to_string(),
        ));
    };
    let mut out = DataTable::with_schema(schema.clone());
    for leaf in collected.iter_mut() {
        match &leaf.table.schema {
            Some(leaf_schema) if *leaf_schema == schema => {}
            _ => {
                return Err(BasaltError::Execution(
                    "selection blocks disagree on schema".to_string(),
                ))
            }
        }
        for row in mem::take(&mut leaf.table.rows) {
            if out.num_rows() >= query.limit {
                return Ok(out);
            }
            out.add_row(row);
        }
    }
    Ok(out)
}

fn merge_aggregation(query: &QueryContext, collected: &[SegmentResult]) -> Result<DataTable> {
    let functions = aggregation_functions_for_query(query)?;
    let mut states: Vec<Value> = functions.iter().map(|function| function.init()).collect();
    for leaf in collected {
        let Some(row) = leaf.table.rows.first() else {
            continue;
        };
        if row.len() != states.len() {
            return Err(BasaltError::Execution(
                "aggregation blocks disagree on width".to_string(),
            ));
        }
        for (i, function) in functions.iter().enumerate() {
            let left = mem::replace(&mut states[i], Value::Null);
            states[i] = function.merge(left, row[i].clone())?;
        }
    }
    let mut out = DataTable::with_schema(aggregation_schema(&functions));
    out.add_row(states);
    Ok(out)
}

fn merge_group_by_legacy(
    query: &QueryContext,
    collected: &mut Vec<SegmentResult>,
    num_groups_limit: usize,
) -> Result<(DataTable, u64)> {
    let functions = aggregation_functions_for_query(query)?;
    let mut merged: Vec<BTreeMap<String, Value>> =
        functions.iter().map(|_| BTreeMap::new()).collect();
    let mut num_groups_dropped = 0_u64;

    for leaf in collected.iter_mut() {
        for (i, function) in functions.iter().enumerate() {
            let Some(row) = leaf.table.rows.get_mut(i) else {
                continue;
            };
            if row.len() < 2 {
                return Err(BasaltError::Execution(
                    "legacy group-by block row is too narrow".to_string(),
                ));
            }
            let Value::Object(ObjectValue::GroupMap(map)) =
                mem::replace(&mut row[1], Value::Null)
            else {
                return Err(BasaltError::Execution(
                    "legacy group-by block without a group map".to_string(),
                ));
            };
            for (group_key, incoming) in map {
                match merged[i].remove(&group_key) {
                    Some(existing) => {
                        merged[i].insert(group_key, function.merge(existing, incoming)?);
                    }
                    None => {
                        if merged[i].len() >= num_groups_limit {
                            num_groups_dropped += 1;
                            continue;
                        }
                        merged[i].insert(group_key, incoming);
                    }
                }
            }
        }
    }

    let mut out = DataTable::with_schema(legacy_group_by_schema());
    for (function, map) in functions.iter().zip(merged) {
        out.add_row(vec![
            Value::String(function.result_column_name()),
            Value::Object(ObjectValue::GroupMap(map)),
        ]);
    }
    Ok((out, num_groups_dropped))
}
