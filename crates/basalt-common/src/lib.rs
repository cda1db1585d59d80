//! Shared configuration, error types, result-table model, and observability
//! primitives for Basalt crates.
//!
//! Architecture role:
//! - defines the server/broker-shared [`DataTable`]/[`DataSchema`] payload model
//! - provides common [`BasaltError`] / [`Result`] contracts and the in-band
//!   [`QueryError`] exception entries
//! - hosts executor configuration and the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`data`]
//! - [`error`]
//! - [`metrics`]

/// Executor and plan-maker configuration types.
pub mod config;
/// Result-table payload model shared by server and broker.
pub mod data;
/// Shared error taxonomy and in-band exception entries.
pub mod error;
/// Prometheus metrics registry and global accessor.
pub mod metrics;

pub use config::{PlanMakerConfig, QueryExecutorConfig};
pub use data::{ColumnType, DataSchema, DataTable, ObjectValue, Value};
pub use error::{BasaltError, FatalQueryError, QueryError, QueryErrorCode, Result};
pub use metrics::{global_metrics, ServerMetrics};
