use std::sync::Arc;

use basalt_common::data::metadata_keys;
use basalt_common::{
    ColumnType, DataTable, QueryErrorCode, QueryExecutorConfig, ServerMetrics, Value,
};
use basalt_core::plan::{
    AggregationPlan, DeadlineSignal, MetadataAggregationPlan, PlanNode,
};
use basalt_core::{
    current_time_ms, BufferingObserver, InstancePlanMaker, QueryPhase, ServerQueryExecutor,
    ServerQueryRequest, StreamObserver, TimerContext,
};
use basalt_query::options::keys;
use basalt_query::{Expression, OrderByExpression, QueryContext};
use basalt_segment::{
    InstanceDataManager, MemorySegmentBuilder, Segment, TableDataManager,
};

const TABLE: &str = "events_OFFLINE";

fn longs(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::Long(*v)).collect()
}

fn strings(values: &[&str]) -> Vec<Value> {
    values.iter().map(|v| Value::String(v.to_string())).collect()
}

fn city_table_manager() -> Arc<TableDataManager> {
    let manager = TableDataManager::new(TABLE);
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("s0")
            .column("city", ColumnType::String, strings(&["A", "B", "A"]))
            .column("n", ColumnType::Long, longs(&[1, 2, 3]))
            .build(),
    ));
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("s1")
            .column("city", ColumnType::String, strings(&["B", "C"]))
            .column("n", ColumnType::Long, longs(&[4, 5]))
            .build(),
    ));
    Arc::new(manager)
}

fn instance_with(manager: Arc<TableDataManager>) -> Arc<InstanceDataManager> {
    let instance = Arc::new(InstanceDataManager::new());
    instance.register_table(manager);
    instance
}

fn executor(instance: Arc<InstanceDataManager>) -> ServerQueryExecutor {
    ServerQueryExecutor::new(&QueryExecutorConfig::default(), instance, ServerMetrics::new())
        .expect("executor")
}

fn request(query: QueryContext, segments: &[&str]) -> ServerQueryRequest {
    ServerQueryRequest {
        request_id: 1,
        broker_id: "broker-1".to_string(),
        table_name_with_type: TABLE.to_string(),
        segments_to_query: segments.iter().map(|s| s.to_string()).collect(),
        query,
        enable_trace: false,
        enable_streaming: false,
    }
}

fn run(executor: &ServerQueryExecutor, request: &ServerQueryRequest) -> DataTable {
    let observer: Arc<dyn StreamObserver> = Arc::new(BufferingObserver::new());
    let mut timer_context = TimerContext::new(current_time_ms());
    executor.process_query(request, &mut timer_context, &observer)
}

#[test]
fn group_by_order_by_merges_segments_and_sorts() {
    let manager = city_table_manager();
    let executor = executor(instance_with(Arc::clone(&manager)));
    let query = QueryContext::builder(vec![
        Expression::identifier("city"),
        Expression::aggregation("sum", vec![Expression::identifier("n")]),
    ])
    .group_by(vec![Expression::identifier("city")])
    .order_by(vec![OrderByExpression::desc(Expression::aggregation(
        "sum",
        vec![Expression::identifier("n")],
    ))])
    .limit(2)
    .option(keys::GROUP_BY_MODE, "sql")
    .option(keys::RESPONSE_FORMAT, "sql")
    .build();
    let table = run(&executor, &request(query, &["s0", "s1"]));

    assert!(table.exceptions.is_empty(), "{:?}", table.exceptions);
    let schema = table.schema.as_ref().expect("schema");
    assert_eq!(schema.num_key_columns(), 1);
    assert_eq!(schema.column_names(), &["city".to_string(), "sum(n)".to_string()]);
    // All groups survive at the server; the broker applies the limit. Order
    // is already order-by order.
    assert_eq!(table.rows.len(), 3);
    assert_eq!(
        table.rows[0],
        vec![Value::String("B".to_string()), Value::Double(6.0)]
    );
    assert_eq!(
        table.rows[1],
        vec![Value::String("C".to_string()), Value::Double(5.0)]
    );
    assert_eq!(
        table.rows[2],
        vec![Value::String("A".to_string()), Value::Double(4.0)]
    );
    assert_eq!(table.metadata_value(metadata_keys::TOTAL_DOCS), Some("5"));
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_SEGMENTS_PROCESSED),
        Some("2")
    );
    // Handles released on every path.
    assert_eq!(manager.segment_refcount("s0"), Some(0));
    assert_eq!(manager.segment_refcount("s1"), Some(0));
}

#[test]
fn scheduling_timeout_returns_in_band_error_without_leaks() {
    let manager = city_table_manager();
    let executor = executor(instance_with(Arc::clone(&manager)));
    let query = QueryContext::builder(vec![Expression::identifier("city")])
        .option(keys::TIMEOUT_MS, "1")
        .build();
    let request = request(query, &["s0", "s1"]);

    let observer: Arc<dyn StreamObserver> = Arc::new(BufferingObserver::new());
    let mut timer_context = TimerContext::new(current_time_ms());
    std::thread::sleep(std::time::Duration::from_millis(10));
    let table = executor.process_query(&request, &mut timer_context, &observer);

    assert_eq!(table.exceptions.len(), 1);
    assert_eq!(
        table.exceptions[0].code,
        QueryErrorCode::QuerySchedulingTimeout
    );
    assert!(table.rows.is_empty());
    assert_eq!(manager.segment_refcount("s0"), Some(0));
    assert_eq!(manager.segment_refcount("s1"), Some(0));
}

#[test]
fn missing_table_returns_in_band_error() {
    let executor = executor(instance_with(city_table_manager()));
    let query = QueryContext::builder(vec![Expression::identifier("city")]).build();
    let mut request = request(query, &["s0"]);
    request.table_name_with_type = "nope_OFFLINE".to_string();

    let table = run(&executor, &request);
    assert_eq!(table.exceptions.len(), 1);
    assert_eq!(table.exceptions[0].code, QueryErrorCode::ServerTableMissing);
}

#[test]
fn metadata_count_answers_from_segment_metadata() {
    let manager = TableDataManager::new(TABLE);
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("s100")
            .column("x", ColumnType::Long, longs(&vec![7; 100]))
            .build(),
    ));
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("s250")
            .column("x", ColumnType::Long, longs(&vec![7; 250]))
            .build(),
    ));
    let executor = executor(instance_with(Arc::new(manager)));
    let query = QueryContext::builder(vec![Expression::aggregation(
        "count",
        vec![Expression::identifier("*")],
    )])
    .build();
    let table = run(&executor, &request(query, &["s100", "s250"]));

    assert!(table.exceptions.is_empty());
    assert_eq!(table.rows, vec![vec![Value::Long(350)]]);
    assert_eq!(table.metadata_value(metadata_keys::TOTAL_DOCS), Some("350"));
    assert_eq!(table.metadata_value(metadata_keys::NUM_DOCS_SCANNED), Some("0"));
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_SEGMENTS_PROCESSED),
        Some("0")
    );
}

#[test]
fn dictionary_min_max_answers_from_sorted_dictionary() {
    let manager = TableDataManager::new(TABLE);
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("dict")
            .column("x", ColumnType::Long, longs(&[10, 20, 30, 40]))
            .build(),
    ));
    let executor = executor(instance_with(Arc::new(manager)));
    let query = QueryContext::builder(vec![
        Expression::aggregation("min", vec![Expression::identifier("x")]),
        Expression::aggregation("max", vec![Expression::identifier("x")]),
    ])
    .build();
    let table = run(&executor, &request(query, &["dict"]));

    assert!(table.exceptions.is_empty());
    assert_eq!(
        table.rows,
        vec![vec![Value::Double(10.0), Value::Double(40.0)]]
    );
}

#[test]
fn metadata_and_scan_count_plans_agree() {
    let segment: Arc<dyn Segment> = Arc::new(
        MemorySegmentBuilder::new("s0")
            .column("x", ColumnType::Long, longs(&[1, 2, 3, 4, 5]))
            .build(),
    );
    let query = Arc::new(
        QueryContext::builder(vec![Expression::aggregation(
            "count",
            vec![Expression::identifier("*")],
        )])
        .build(),
    );
    let deadline = || Arc::new(DeadlineSignal::new(current_time_ms() + 10_000));

    let metadata = PlanNode::MetadataAggregation(MetadataAggregationPlan {
        segment: Arc::clone(&segment),
        query: Arc::clone(&query),
    })
    .execute(deadline())
    .expect("metadata plan");
    let scan = PlanNode::Aggregation(AggregationPlan {
        segment: Arc::clone(&segment),
        query: Arc::clone(&query),
    })
    .execute(deadline())
    .expect("scan plan");

    assert_eq!(metadata.rows, scan.rows);
    assert_eq!(metadata.rows, vec![vec![Value::Long(5)]]);
}

#[test]
fn dictionary_and_scan_min_max_plans_agree() {
    use basalt_core::plan::DictionaryAggregationPlan;
    let segment: Arc<dyn Segment> = Arc::new(
        MemorySegmentBuilder::new("s0")
            .column("x", ColumnType::Long, longs(&[10, 20, 30, 40]))
            .build(),
    );
    let query = Arc::new(
        QueryContext::builder(vec![
            Expression::aggregation("min", vec![Expression::identifier("x")]),
            Expression::aggregation("max", vec![Expression::identifier("x")]),
            Expression::aggregation("minmaxrange", vec![Expression::identifier("x")]),
        ])
        .build(),
    );
    let deadline = || Arc::new(DeadlineSignal::new(current_time_ms() + 10_000));

    let dictionary = PlanNode::DictionaryAggregation(DictionaryAggregationPlan {
        segment: Arc::clone(&segment),
        query: Arc::clone(&query),
    })
    .execute(deadline())
    .expect("dictionary plan");
    let scan = PlanNode::Aggregation(AggregationPlan {
        segment: Arc::clone(&segment),
        query: Arc::clone(&query),
    })
    .execute(deadline())
    .expect("scan plan");

    assert_eq!(dictionary.rows, scan.rows);
}

#[test]
fn selection_streaming_sends_data_then_metadata() {
    let manager = city_table_manager();
    let executor = executor(instance_with(manager));
    let query = QueryContext::builder(vec![
        Expression::identifier("city"),
        Expression::identifier("n"),
    ])
    .limit(10)
    .build();
    let mut request = request(query, &["s0", "s1"]);
    request.enable_streaming = true;

    let observer = Arc::new(BufferingObserver::new());
    let payload = serde_json::to_vec(&request).expect("encode");
    executor
        .submit(&payload, Arc::clone(&observer) as Arc<dyn StreamObserver>)
        .expect("submit");

    let tables = observer.tables();
    // Two data blocks (one per segment) plus the closing metadata table.
    assert_eq!(tables.len(), 3);
    let data_rows: usize = tables[..2].iter().map(DataTable::num_rows).sum();
    assert_eq!(data_rows, 5);
    let closing = &tables[2];
    assert!(closing.rows.is_empty());
    assert_eq!(closing.metadata_value(metadata_keys::TOTAL_DOCS), Some("5"));
    assert_eq!(
        closing.metadata_value(metadata_keys::NUM_SEGMENTS_QUERIED),
        Some("2")
    );
}

#[test]
fn unanchored_order_by_is_reported_as_execution_error() {
    let manager = city_table_manager();
    let executor = executor(instance_with(Arc::clone(&manager)));
    let query = QueryContext::builder(vec![
        Expression::identifier("city"),
        Expression::aggregation("sum", vec![Expression::identifier("n")]),
    ])
    .group_by(vec![Expression::identifier("city")])
    .order_by(vec![OrderByExpression::asc(Expression::identifier("n"))])
    .option(keys::GROUP_BY_MODE, "sql")
    .build();

    let table = run(&executor, &request(query, &["s0"]));
    assert_eq!(table.exceptions.len(), 1);
    assert_eq!(table.exceptions[0].code, QueryErrorCode::QueryExecution);
    assert_eq!(manager.segment_refcount("s0"), Some(0));
}

#[test]
fn pruned_to_empty_reports_zero_counters_and_total_docs() {
    let manager = city_table_manager();
    let executor = executor(instance_with(manager));
    let query = QueryContext::builder(vec![Expression::identifier("city")])
        .filter(basalt_query::FilterContext::predicate(
            Expression::identifier("n"),
            basalt_query::PredicateOp::Gt,
            vec![Value::Long(1_000)],
        ))
        .build();
    let table = run(&executor, &request(query, &["s0", "s1"]));

    assert!(table.exceptions.is_empty());
    assert!(table.rows.is_empty());
    assert_eq!(table.metadata_value(metadata_keys::TOTAL_DOCS), Some("5"));
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_SEGMENTS_PROCESSED),
        Some("0")
    );
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_SEGMENTS_MATCHED),
        Some("0")
    );
}

#[test]
fn missing_segments_are_reported_not_fatal() {
    let manager = city_table_manager();
    let executor = executor(instance_with(Arc::clone(&manager)));
    let query = QueryContext::builder(vec![Expression::aggregation(
        "count",
        vec![Expression::identifier("*")],
    )])
    .build();
    let table = run(&executor, &request(query, &["s0", "s1", "gone"]));

    assert!(table.exceptions.is_empty());
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_SEGMENTS_QUERIED),
        Some("3")
    );
    assert_eq!(table.rows, vec![vec![Value::Long(5)]]);
}

#[test]
fn trace_metadata_is_attached_and_registry_is_released() {
    use basalt_core::TraceContext;
    let manager = city_table_manager();
    let executor = executor(instance_with(manager));
    let query = QueryContext::builder(vec![Expression::identifier("city")]).build();
    let mut request = request(query, &["s0"]);
    request.request_id = 4242;
    request.enable_trace = true;

    let table = run(&executor, &request);
    let trace = table
        .metadata_value(metadata_keys::TRACE_INFO)
        .expect("trace info");
    assert!(trace.contains(QueryPhase::SegmentPruning.as_str()));
    assert!(!TraceContext::is_registered(4242));
}

#[test]
fn segment_error_returns_partial_results_with_exception() {
    let manager = TableDataManager::new(TABLE);
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("good")
            .column("n", ColumnType::Long, longs(&[1, 2]))
            .build(),
    ));
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("bad")
            .column("m", ColumnType::Long, longs(&[3]))
            .build(),
    ));
    let manager = Arc::new(manager);
    let executor = executor(instance_with(Arc::clone(&manager)));
    let query = QueryContext::builder(vec![Expression::identifier("n")])
        .limit(10)
        .build();
    let table = run(&executor, &request(query, &["good", "bad"]));

    // The segment without the column fails its plan; the healthy segment
    // still answers and the failure rides along in-band.
    assert_eq!(table.rows, vec![vec![Value::Long(1)], vec![Value::Long(2)]]);
    assert_eq!(table.exceptions.len(), 1);
    assert_eq!(table.exceptions[0].code, QueryErrorCode::QueryExecution);
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_SEGMENTS_PROCESSED),
        Some("1")
    );
    assert_eq!(manager.segment_refcount("good"), Some(0));
    assert_eq!(manager.segment_refcount("bad"), Some(0));
}

#[test]
fn legacy_group_by_emits_per_aggregation_group_maps() {
    use basalt_common::ObjectValue;
    let manager = city_table_manager();
    let executor = executor(instance_with(manager));
    // No groupByMode option: the legacy per-aggregation pipeline.
    let query = QueryContext::builder(vec![Expression::aggregation(
        "sum",
        vec![Expression::identifier("n")],
    )])
    .group_by(vec![Expression::identifier("city")])
    .limit(10)
    .build();
    let table = run(&executor, &request(query, &["s0", "s1"]));

    assert!(table.exceptions.is_empty(), "{:?}", table.exceptions);
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.rows[0][0], Value::String("sum(n)".to_string()));
    let Value::Object(ObjectValue::GroupMap(map)) = &table.rows[0][1] else {
        panic!("legacy layout carries a group map cell");
    };
    assert_eq!(map.get("A"), Some(&Value::Double(4.0)));
    assert_eq!(map.get("B"), Some(&Value::Double(6.0)));
    assert_eq!(map.get("C"), Some(&Value::Double(5.0)));
}

#[test]
fn consuming_segments_report_freshness_metadata() {
    let manager = TableDataManager::new(TABLE);
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("sealed")
            .column("n", ColumnType::Long, longs(&[1, 2]))
            .build(),
    ));
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("consuming0")
            .column("n", ColumnType::Long, longs(&[3]))
            .mutable(Some(1_000), Some(2_000))
            .build(),
    ));
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("consuming1")
            .column("n", ColumnType::Long, longs(&[4]))
            .mutable(Some(900), Some(1_500))
            .build(),
    ));
    let executor = executor(instance_with(Arc::new(manager)));
    let query = QueryContext::builder(vec![Expression::aggregation(
        "sum",
        vec![Expression::identifier("n")],
    )])
    .build();
    let table = run(
        &executor,
        &request(query, &["sealed", "consuming0", "consuming1"]),
    );

    assert!(table.exceptions.is_empty());
    assert_eq!(table.rows, vec![vec![Value::Double(10.0)]]);
    assert_eq!(
        table.metadata_value(metadata_keys::NUM_CONSUMING_SEGMENTS_PROCESSED),
        Some("2")
    );
    // Minimum ingestion time across the consuming segments.
    assert_eq!(
        table.metadata_value(metadata_keys::MIN_CONSUMING_FRESHNESS_TIME_MS),
        Some("1500")
    );
}

#[test]
fn consuming_freshness_falls_back_to_index_time() {
    let manager = TableDataManager::new(TABLE);
    manager.add_segment(Arc::new(
        MemorySegmentBuilder::new("consuming0")
            .column("n", ColumnType::Long, longs(&[3]))
            .mutable(Some(1_000), None)
            .build(),
    ));
    let executor = executor(instance_with(Arc::new(manager)));
    let query = QueryContext::builder(vec![Expression::aggregation(
        "count",
        vec![Expression::identifier("*")],
    )])
    .build();
    let table = run(&executor, &request(query, &["consuming0"]));

    assert_eq!(
        table.metadata_value(metadata_keys::MIN_CONSUMING_FRESHNESS_TIME_MS),
        Some("1000")
    );
}

#[test]
fn plan_maker_rejects_invalid_capacity_config() {
    use basalt_common::config::PlanMakerConfig;
    let config = PlanMakerConfig {
        max_initial_result_holder_capacity: 10,
        num_groups_limit: 5,
    };
    assert!(InstancePlanMaker::from_config(&config).is_err());
}
