use std::sync::Arc;

use basalt_common::config::{
    PlanMakerConfig, DEFAULT_MAX_INITIAL_RESULT_HOLDER_CAPACITY, DEFAULT_NUM_GROUPS_LIMIT,
};
use basalt_common::{BasaltError, Result};
use basalt_query::{Expression, QueryContext, QueryOptions};
use basalt_segment::Segment;
use tracing::info;

use crate::pool::WorkerPool;
use crate::response::StreamObserver;
use crate::plan::{
    AggregationGroupByOrderByPlan, AggregationGroupByPlan, AggregationPlan, CombinePlan,
    DictionaryAggregationPlan, InstanceResponsePlan, MetadataAggregationPlan, PlanNode,
    SelectionPlan,
};

/// Builds instance plans: one leaf per segment under a combine node and an
/// instance-response root.
///
/// Leaf selection is a pure function of the query shape and the segment's
/// capabilities.
pub struct InstancePlanMaker {
    max_initial_result_holder_capacity: usize,
    num_groups_limit: usize,
}

impl InstancePlanMaker {
    pub fn new() -> Self {
        Self {
            max_initial_result_holder_capacity: DEFAULT_MAX_INITIAL_RESULT_HOLDER_CAPACITY,
            num_groups_limit: DEFAULT_NUM_GROUPS_LIMIT,
        }
    }

    /// Builds a plan maker from validated configuration.
    pub fn from_config(config: &PlanMakerConfig) -> Result<Self> {
        config.validate()?;
        info!(
            max_initial_result_holder_capacity = config.max_initial_result_holder_capacity,
            num_groups_limit = config.num_groups_limit,
            "initializing plan maker"
        );
        Ok(Self {
            max_initial_result_holder_capacity: config.max_initial_result_holder_capacity,
            num_groups_limit: config.num_groups_limit,
        })
    }

    /// Builds the non-streaming instance plan over the surviving segments.
    pub fn make_instance_plan(
        &self,
        segments: Vec<Arc<dyn Segment>>,
        query: Arc<QueryContext>,
        pool: Arc<WorkerPool>,
        table_name: &str,
        end_time_ms: u64,
    ) -> InstanceResponsePlan {
        let children = segments
            .into_iter()
            .map(|segment| self.make_segment_plan_node(segment, Arc::clone(&query)))
            .collect();
        InstanceResponsePlan {
            combine: CombinePlan {
                children,
                query,
                pool,
                table_name: table_name.to_string(),
                end_time_ms,
                max_initial_result_holder_capacity: self.max_initial_result_holder_capacity,
                num_groups_limit: self.num_groups_limit,
                observer: None,
            },
        }
    }

    /// Builds the streaming instance plan: data blocks go straight to the
    /// observer and the returned plan yields the closing metadata table.
    pub fn make_streaming_instance_plan(
        &self,
        segments: Vec<Arc<dyn Segment>>,
        query: Arc<QueryContext>,
        pool: Arc<WorkerPool>,
        table_name: &str,
        end_time_ms: u64,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<InstanceResponsePlan> {
        if query.is_aggregation_query() {
            return Err(BasaltError::BadQuery(
                "streaming requests support selection queries only".to_string(),
            ));
        }
        let children = segments
            .into_iter()
            .map(|segment| self.make_segment_plan_node(segment, Arc::clone(&query)))
            .collect();
        Ok(InstanceResponsePlan {
            combine: CombinePlan {
                children,
                query,
                pool,
                table_name: table_name.to_string(),
                end_time_ms,
                max_initial_result_holder_capacity: self.max_initial_result_holder_capacity,
                num_groups_limit: self.num_groups_limit,
                observer: Some(observer),
            },
        })
    }

    /// Picks the leaf plan kind for one segment.
    pub fn make_segment_plan_node(
        &self,
        segment: Arc<dyn Segment>,
        query: Arc<QueryContext>,
    ) -> PlanNode {
        if !query.is_aggregation_query() {
            return PlanNode::Selection(SelectionPlan { segment, query });
        }
        if query.group_by_expressions.is_some() {
            // The SQL combine pipeline only when groupByMode is explicitly sql.
            if QueryOptions::new(&query.query_options).is_group_by_mode_sql() {
                return PlanNode::AggregationGroupByOrderBy(AggregationGroupByOrderByPlan {
                    segment,
                    query,
                    max_initial_result_holder_capacity: self.max_initial_result_holder_capacity,
                    num_groups_limit: self.num_groups_limit,
                });
            }
            return PlanNode::AggregationGroupBy(AggregationGroupByPlan {
                segment,
                query,
                max_initial_result_holder_capacity: self.max_initial_result_holder_capacity,
                num_groups_limit: self.num_groups_limit,
            });
        }
        if query.filter.is_none() {
            if Self::is_fit_for_metadata_based_plan(&query) {
                return PlanNode::MetadataAggregation(MetadataAggregationPlan { segment, query });
            }
            if Self::is_fit_for_dictionary_based_plan(&query, segment.as_ref()) {
                return PlanNode::DictionaryAggregation(DictionaryAggregationPlan {
                    segment,
                    query,
                });
            }
        }
        PlanNode::Aggregation(AggregationPlan { segment, query })
    }

    /// Whether an aggregation-only query without filter can be answered from
    /// segment metadata. Aggregations supported: COUNT.
    fn is_fit_for_metadata_based_plan(query: &QueryContext) -> bool {
        query.select_expressions.iter().all(|expression| {
            expression
                .function()
                .map(|call| call.name == "count")
                .unwrap_or(false)
        })
    }

    /// Whether an aggregation-only query without filter can be answered from
    /// sorted dictionaries. Aggregations supported: MIN, MAX, MINMAXRANGE.
    fn is_fit_for_dictionary_based_plan(query: &QueryContext, segment: &dyn Segment) -> bool {
        for expression in &query.select_expressions {
            let Some(call) = expression.function() else {
                return false;
            };
            if !matches!(call.name.as_str(), "min" | "max" | "minmaxrange") {
                return false;
            }
            let Some(Expression::Identifier(column)) = call.arguments.first() else {
                return false;
            };
            let sorted_dictionary = segment
                .data_source(column)
                .and_then(|data_source| data_source.dictionary())
                .map(|dictionary| dictionary.is_sorted())
                .unwrap_or(false);
            if !sorted_dictionary {
                return false;
            }
        }
        true
    }
}

impl Default for InstancePlanMaker {
    fn default() -> Self {
        Self::new()
    }
}
