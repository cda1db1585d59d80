use std::sync::Arc;

use basalt_common::data::metadata_keys;
use basalt_common::{
    BasaltError, DataTable, FatalQueryError, QueryError, QueryErrorCode, QueryExecutorConfig,
    Result, ServerMetrics,
};
use basalt_query::{QueryContext, QueryOptions};
use basalt_segment::{InstanceDataManager, Segment, SegmentHandle, SegmentPrunerService};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::plan::maker::InstancePlanMaker;
use crate::pool::WorkerPool;
use crate::response::StreamObserver;
use crate::timer::{current_time_ms, QueryPhase, TimerContext};
use crate::trace::TraceContext;

/// One serialized query request as it arrives from a broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerQueryRequest {
    /// Broker-assigned request id.
    #[serde(rename = "requestId")]
    pub request_id: u64,
    /// Identity of the sending broker.
    #[serde(rename = "brokerId", default)]
    pub broker_id: String,
    /// Target table, with type suffix.
    #[serde(rename = "tableNameWithType")]
    pub table_name_with_type: String,
    /// Segments this server should answer from.
    #[serde(rename = "segmentsToQuery")]
    pub segments_to_query: Vec<String>,
    /// Compiled query shape.
    pub query: QueryContext,
    /// Whether to collect and return trace info.
    #[serde(rename = "enableTrace", default)]
    pub enable_trace: bool,
    /// Whether to stream data blocks before the metadata response.
    #[serde(rename = "enableStreaming", default)]
    pub enable_streaming: bool,
}

impl ServerQueryRequest {
    /// Decodes the request envelope. Failure is fatal to the request.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| BasaltError::Serialization(format!("request decode failed: {e}")))
    }
}

/// The server-side query front door.
///
/// Drives one request through decode, segment acquisition, pruning, plan
/// construction, and deadline-bound execution, then frames the response.
/// Execution failures stay in-band on the result table; only request decode
/// and response delivery are fatal to the request.
pub struct ServerQueryExecutor {
    instance_data_manager: Arc<InstanceDataManager>,
    metrics: ServerMetrics,
    default_timeout_ms: u64,
    pruner_service: SegmentPrunerService,
    plan_maker: InstancePlanMaker,
    worker_pool: Arc<WorkerPool>,
}

impl ServerQueryExecutor {
    pub fn new(
        config: &QueryExecutorConfig,
        instance_data_manager: Arc<InstanceDataManager>,
        metrics: ServerMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let plan_maker = InstancePlanMaker::from_config(&config.plan_maker)?;
        let worker_pool = Arc::new(WorkerPool::new(config.num_worker_threads)?);
        info!(
            default_timeout_ms = config.default_timeout_ms,
            num_worker_threads = config.num_worker_threads,
            "initialized query executor"
        );
        Ok(Self {
            instance_data_manager,
            metrics,
            default_timeout_ms: config.default_timeout_ms,
            pruner_service: SegmentPrunerService::with_default_pruners(),
            plan_maker,
            worker_pool,
        })
    }

    /// Decodes and processes one request, delivering the response through the
    /// observer. Returns `Err` only for fatal-to-request conditions, with the
    /// code the transport maps into its own status space: request decode
    /// (`INVALID_ARGUMENT`) and response delivery (`INTERNAL`).
    pub fn submit(
        &self,
        payload: &[u8],
        observer: Arc<dyn StreamObserver>,
    ) -> std::result::Result<(), FatalQueryError> {
        let mut timer_context = TimerContext::new(current_time_ms());
        let request = match ServerQueryRequest::decode(payload) {
            Ok(request) => request,
            Err(error) => {
                self.metrics.inc_request_deserialization_exceptions();
                error!(%error, "caught exception while deserializing the request");
                return Err(FatalQueryError::new(QueryErrorCode::InvalidArgument, error));
            }
        };
        let data_table = self.process_query(&request, &mut timer_context, &observer);
        self.send_response(&request, observer.as_ref(), &data_table)
    }

    /// Runs the full pipeline for a decoded request. Always produces a table;
    /// errors are attached in-band.
    pub fn process_query(
        &self,
        request: &ServerQueryRequest,
        timer_context: &mut TimerContext,
        observer: &Arc<dyn StreamObserver>,
    ) -> DataTable {
        timer_context.stop_and_record(QueryPhase::SchedulerWait);
        timer_context.start(QueryPhase::QueryProcessing);

        let request_id = request.request_id;
        let table_name = &request.table_name_with_type;
        self.metrics.inc_queries(table_name);
        debug!(request_id, table = %table_name, "incoming query request");

        // Use the timeout passed in the request if present, or the
        // instance-level timeout.
        let query_timeout_ms = match QueryOptions::new(&request.query.query_options).timeout_ms()
        {
            Ok(Some(timeout)) => timeout,
            Ok(None) => self.default_timeout_ms,
            Err(error) => {
                self.metrics.inc_query_execution_exceptions(table_name);
                info!(request_id, %error, "rejecting request with bad timeout option");
                let mut table = DataTable::empty();
                table.add_exception(QueryError::new(
                    QueryErrorCode::QueryExecution,
                    error.to_string(),
                ));
                return table;
            }
        };

        // Scheduler wait already exceeds the query timeout.
        let query_arrival_time_ms = timer_context.query_arrival_time_ms();
        let query_scheduling_time_ms = current_time_ms().saturating_sub(query_arrival_time_ms);
        if query_scheduling_time_ms >= query_timeout_ms {
            self.metrics.inc_scheduling_timeout_exceptions(table_name);
            let message = format!(
                "query scheduling took {query_scheduling_time_ms}ms (longer than query timeout of {query_timeout_ms}ms)"
            );
            error!(request_id, %message);
            let mut table = DataTable::empty();
            table.add_exception(QueryError::new(
                QueryErrorCode::QuerySchedulingTimeout,
                message,
            ));
            return table;
        }

        let Some(table_data_manager) = self.instance_data_manager.table_data_manager(table_name)
        else {
            let message = format!("failed to find table: {table_name}");
            error!(request_id, %message);
            let mut table = DataTable::empty();
            table.add_exception(QueryError::new(
                QueryErrorCode::ServerTableMissing,
                message,
            ));
            return table;
        };

        let handles = table_data_manager.acquire_segments(&request.segments_to_query);
        let num_segments_queried = request.segments_to_query.len();
        let num_segments_acquired = handles.len();
        if num_segments_queried > num_segments_acquired {
            // Routing can lag segment relocation; missing segments are legal
            // and reported, not fatal.
            self.metrics.add_missing_segments(
                table_name,
                (num_segments_queried - num_segments_acquired) as u64,
            );
        }

        if request.enable_trace {
            TraceContext::register(request_id);
        }

        // Freshness stats across realtime consuming segments.
        let mut num_consuming_segments_processed = 0_u64;
        let mut min_index_time_ms = i64::MAX;
        let mut min_ingestion_time_ms = i64::MAX;
        for handle in &handles {
            let segment = handle.segment();
            if segment.is_mutable() {
                num_consuming_segments_processed += 1;
                if let Some(indexed) = segment.last_indexed_timestamp_ms() {
                    min_index_time_ms = min_index_time_ms.min(indexed);
                }
                if let Some(ingested) = segment.latest_ingestion_timestamp_ms() {
                    min_ingestion_time_ms = min_ingestion_time_ms.min(ingested);
                }
            }
        }
        let mut min_consuming_freshness_time_ms = min_ingestion_time_ms;
        if num_consuming_segments_processed > 0 && min_ingestion_time_ms == i64::MAX {
            debug!(
                request_id,
                "no valid ingestion timestamp across consuming segments, using index time"
            );
            min_consuming_freshness_time_ms = min_index_time_ms;
        }

        let end_time_ms = query_arrival_time_ms + query_timeout_ms;
        let result = self.execute_plan(request, handles, timer_context, end_time_ms, observer);
        let mut data_table = match result {
            Ok(table) => table,
            Err(error) => {
                self.metrics.inc_query_execution_exceptions(table_name);
                // A bad query reflects client input, not a server fault.
                match &error {
                    BasaltError::BadQuery(_) => {
                        info!(request_id, %error, "caught bad query request")
                    }
                    _ => error!(request_id, %error, "exception processing request"),
                }
                let mut table = DataTable::empty();
                table.add_exception(QueryError::new(
                    QueryErrorCode::QueryExecution,
                    error.to_string(),
                ));
                table
            }
        };

        if request.enable_trace {
            for (phase, duration_ms) in timer_context.recorded_phases() {
                TraceContext::log(request_id, format!("{}={}ms", phase.as_str(), duration_ms));
            }
            data_table.set_metadata(
                metadata_keys::TRACE_INFO,
                TraceContext::trace_info(request_id),
            );
            TraceContext::unregister(request_id);
        }

        timer_context.stop_and_record(QueryPhase::QueryProcessing);
        let query_processing_time_ms = timer_context
            .duration_ms(QueryPhase::QueryProcessing)
            .unwrap_or(0);
        data_table.set_metadata(metadata_keys::NUM_SEGMENTS_QUERIED, num_segments_queried);
        data_table.set_metadata(metadata_keys::TIME_USED_MS, query_processing_time_ms);
        if num_consuming_segments_processed > 0 {
            data_table.set_metadata(
                metadata_keys::NUM_CONSUMING_SEGMENTS_PROCESSED,
                num_consuming_segments_processed,
            );
            data_table.set_metadata(
                metadata_keys::MIN_CONSUMING_FRESHNESS_TIME_MS,
                min_consuming_freshness_time_ms,
            );
        }
        self.metrics
            .observe_query_processing(table_name, query_processing_time_ms as f64 / 1_000.0);
        debug!(request_id, time_used_ms = query_processing_time_ms, "query processing done");
        data_table
    }

    /// Prunes, plans, and executes. Handles move in here so that every exit
    /// path, including errors and panics, releases them exactly once.
    fn execute_plan(
        &self,
        request: &ServerQueryRequest,
        handles: Vec<SegmentHandle>,
        timer_context: &mut TimerContext,
        end_time_ms: u64,
        observer: &Arc<dyn StreamObserver>,
    ) -> Result<DataTable> {
        request.query.validate()?;
        let query = Arc::new(request.query.clone());

        // Total docs for the table, computed before pruning.
        let num_total_docs: u64 = handles
            .iter()
            .map(|handle| handle.segment().total_docs() as u64)
            .sum();

        timer_context.start(QueryPhase::SegmentPruning);
        let kept = self.pruner_service.prune(handles, &request.query);
        timer_context.stop_and_record(QueryPhase::SegmentPruning);
        debug!(
            request_id = request.request_id,
            matched = kept.len(),
            "segments after pruning"
        );

        if kept.is_empty() {
            let mut table = DataTable::empty();
            table.set_metadata(metadata_keys::TOTAL_DOCS, num_total_docs);
            table.set_metadata(metadata_keys::NUM_DOCS_SCANNED, 0);
            table.set_metadata(metadata_keys::NUM_ENTRIES_SCANNED_IN_FILTER, 0);
            table.set_metadata(metadata_keys::NUM_ENTRIES_SCANNED_POST_FILTER, 0);
            table.set_metadata(metadata_keys::NUM_SEGMENTS_PROCESSED, 0);
            table.set_metadata(metadata_keys::NUM_SEGMENTS_MATCHED, 0);
            return Ok(table);
        }

        timer_context.start(QueryPhase::BuildQueryPlan);
        let segments: Vec<Arc<dyn Segment>> = kept
            .iter()
            .map(|handle| Arc::clone(handle.segment()))
            .collect();
        let plan = if request.enable_streaming {
            self.plan_maker.make_streaming_instance_plan(
                segments,
                query,
                Arc::clone(&self.worker_pool),
                &request.table_name_with_type,
                end_time_ms,
                Arc::clone(observer),
            )?
        } else {
            self.plan_maker.make_instance_plan(
                segments,
                query,
                Arc::clone(&self.worker_pool),
                &request.table_name_with_type,
                end_time_ms,
            )
        };
        timer_context.stop_and_record(QueryPhase::BuildQueryPlan);

        timer_context.start(QueryPhase::QueryPlanExecution);
        let mut data_table = plan.execute()?;
        timer_context.stop_and_record(QueryPhase::QueryPlanExecution);

        // Total docs reflects un-pruned segments.
        data_table.set_metadata(metadata_keys::TOTAL_DOCS, num_total_docs);
        Ok(data_table)
    }

    fn send_response(
        &self,
        request: &ServerQueryRequest,
        observer: &dyn StreamObserver,
        data_table: &DataTable,
    ) -> std::result::Result<(), FatalQueryError> {
        if let Err(error) = observer.on_data(data_table) {
            self.metrics.inc_response_serialization_exceptions();
            error!(
                request_id = request.request_id,
                %error,
                "caught exception while sending response"
            );
            return Err(FatalQueryError::new(
                QueryErrorCode::Internal,
                BasaltError::Serialization(format!("response delivery failed: {error}")),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::BufferingObserver;

    struct FailingObserver;

    impl StreamObserver for FailingObserver {
        fn on_data(&self, _table: &DataTable) -> Result<()> {
            Err(BasaltError::Serialization("stream closed".to_string()))
        }
    }

    fn test_executor() -> ServerQueryExecutor {
        ServerQueryExecutor::new(
            &QueryExecutorConfig::default(),
            Arc::new(InstanceDataManager::new()),
            ServerMetrics::new(),
        )
        .expect("executor")
    }

    fn test_request() -> ServerQueryRequest {
        ServerQueryRequest {
            request_id: 7,
            broker_id: "broker-1".to_string(),
            table_name_with_type: "events_OFFLINE".to_string(),
            segments_to_query: vec!["s0".to_string()],
            query: QueryContext::builder(vec![basalt_query::Expression::identifier("x")])
                .build(),
            enable_trace: false,
            enable_streaming: false,
        }
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(matches!(
            ServerQueryRequest::decode(b"{not json"),
            Err(BasaltError::Serialization(_))
        ));
    }

    #[test]
    fn malformed_payload_is_fatal_with_invalid_argument() {
        let executor = test_executor();
        let observer: Arc<dyn StreamObserver> = Arc::new(BufferingObserver::new());
        let fatal = executor
            .submit(b"{not json", observer)
            .expect_err("decode failure is fatal");
        assert_eq!(fatal.code, QueryErrorCode::InvalidArgument);
    }

    #[test]
    fn failed_response_delivery_is_fatal_with_internal() {
        let executor = test_executor();
        let payload = serde_json::to_vec(&test_request()).expect("encode");
        let fatal = executor
            .submit(&payload, Arc::new(FailingObserver))
            .expect_err("delivery failure is fatal");
        assert_eq!(fatal.code, QueryErrorCode::Internal);
    }

    #[test]
    fn decode_round_trips_a_request() {
        let request = ServerQueryRequest {
            request_id: 7,
            broker_id: "broker-1".to_string(),
            table_name_with_type: "events_OFFLINE".to_string(),
            segments_to_query: vec!["s0".to_string()],
            query: QueryContext::builder(vec![basalt_query::Expression::identifier("x")])
                .build(),
            enable_trace: false,
            enable_streaming: false,
        };
        let payload = serde_json::to_vec(&request).expect("encode");
        let decoded = ServerQueryRequest::decode(&payload).expect("decode");
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.table_name_with_type, "events_OFFLINE");
    }
}
