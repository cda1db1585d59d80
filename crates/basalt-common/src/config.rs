use serde::{Deserialize, Serialize};

use crate::error::{BasaltError, Result};

/// Fallback per-query deadline when the request carries no override.
pub const DEFAULT_QUERY_EXECUTOR_TIMEOUT_MS: u64 = 15_000;

/// Default per-segment initial group-holder capacity.
pub const DEFAULT_MAX_INITIAL_RESULT_HOLDER_CAPACITY: usize = 10_000;

/// Default hard cap on distinct groups combined across segments.
pub const DEFAULT_NUM_GROUPS_LIMIT: usize = 100_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_QUERY_EXECUTOR_TIMEOUT_MS
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_holder_capacity() -> usize {
    DEFAULT_MAX_INITIAL_RESULT_HOLDER_CAPACITY
}

fn default_num_groups_limit() -> usize {
    DEFAULT_NUM_GROUPS_LIMIT
}

/// Group-by capacity knobs consumed by the instance plan maker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanMakerConfig {
    /// Per-segment initial group-holder capacity.
    #[serde(
        rename = "max.init.group.holder.capacity",
        default = "default_holder_capacity"
    )]
    pub max_initial_result_holder_capacity: usize,
    /// Hard cap on distinct groups combined across segments; groups beyond it
    /// are dropped silently and counted.
    #[serde(rename = "num.groups.limit", default = "default_num_groups_limit")]
    pub num_groups_limit: usize,
}

impl Default for PlanMakerConfig {
    fn default() -> Self {
        Self {
            max_initial_result_holder_capacity: DEFAULT_MAX_INITIAL_RESULT_HOLDER_CAPACITY,
            num_groups_limit: DEFAULT_NUM_GROUPS_LIMIT,
        }
    }
}

impl PlanMakerConfig {
    /// Checks the capacity/limit ordering invariant.
    pub fn validate(&self) -> Result<()> {
        if self.max_initial_result_holder_capacity > self.num_groups_limit {
            return Err(BasaltError::InvalidConfig(format!(
                "maxInitialResultHolderCapacity: {} must be smaller or equal to numGroupsLimit: {}",
                self.max_initial_result_holder_capacity, self.num_groups_limit
            )));
        }
        Ok(())
    }
}

/// Server-level query executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExecutorConfig {
    /// Instance-level query timeout applied when the request has no override.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Fixed worker-pool size shared across queries.
    #[serde(default = "default_worker_threads")]
    pub num_worker_threads: usize,
    /// Group-by capacity knobs.
    #[serde(default)]
    pub plan_maker: PlanMakerConfig,
}

impl Default for QueryExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_QUERY_EXECUTOR_TIMEOUT_MS,
            num_worker_threads: default_worker_threads(),
            plan_maker: PlanMakerConfig::default(),
        }
    }
}

impl QueryExecutorConfig {
    /// Checks all nested invariants.
    pub fn validate(&self) -> Result<()> {
        if self.num_worker_threads == 0 {
            return Err(BasaltError::InvalidConfig(
                "num_worker_threads must be positive".to_string(),
            ));
        }
        self.plan_maker.validate()
    }
}
