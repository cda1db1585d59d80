//! Broker-side reduce for Basalt.
//!
//! Architecture role:
//! - merges per-server result tables into the final broker response
//! - honors the `(groupByMode, responseFormat)` presentation dials
//! - reuses the server-side indexed table for the SQL group-by pipeline
//!
//! Key modules:
//! - [`reduce`]
//! - [`response`]
//! - [`trim`] (legacy trimming service)

/// Group-by reduction across server tables.
pub mod reduce;
/// Broker response types.
pub mod response;
/// Legacy per-aggregation trimming.
pub mod trim;

pub use reduce::GroupByBrokerReducer;
pub use response::{AggregationResult, BrokerResponse, GroupByResult, ResultTable};
pub use trim::AggregationGroupByTrimmingService;
