//! Compiled query shape and aggregation capabilities for Basalt.
//!
//! Architecture role:
//! - defines the normalized [`QueryContext`] a server executes against
//! - provides the expression/filter algebra referenced by plans and pruners
//! - hosts the aggregation-function capability trait and registry shared by
//!   server-side combine and broker-side reduce
//!
//! Key modules:
//! - [`context`]
//! - [`expr`]
//! - [`options`]
//! - [`aggregation`]
//! - [`legacy`] (backward-compatible argument encoding)

pub mod aggregation;
/// Query context and shape validation.
pub mod context;
/// Expression, order-by, and filter trees.
pub mod expr;
/// Legacy value formatting for non-`preserveType` responses.
pub mod format;
/// Backward-compatible aggregation argument encoding.
pub mod legacy;
/// Typed view over the raw query-option map.
pub mod options;

pub use aggregation::{aggregation_functions_for_query, from_function, AggregationFunction};
pub use context::{QueryContext, QueryContextBuilder, DEFAULT_LIMIT};
pub use expr::{
    Expression, FilterContext, FunctionCall, FunctionKind, OrderByExpression, Predicate,
    PredicateOp,
};
pub use format::format_value;
pub use options::QueryOptions;
