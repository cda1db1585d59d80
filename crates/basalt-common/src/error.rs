use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical Basalt error taxonomy used across crates.
///
/// Classification guidance:
/// - [`BasaltError::BadQuery`]: query shape/name/type issues caused by client input
/// - [`BasaltError::Execution`]: runtime plan execution, scan, or merge failures
/// - [`BasaltError::InvalidConfig`]: configuration/contract violations at init time
/// - [`BasaltError::Serialization`]: request decode or response encode failures
/// - [`BasaltError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum BasaltError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - plan-maker holder capacity above the groups limit
    /// - non-positive worker-thread count
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid query shape caused by client input.
    ///
    /// Examples:
    /// - order-by expression that is neither a group-by expression nor an aggregation
    /// - unknown aggregation function name
    /// - unknown column referenced by a select expression
    ///
    /// Logged at info level, not error: it reflects the request, not the server.
    #[error("bad query: {0}")]
    BadQuery(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - type mismatch between an aggregation intermediate and its merge input
    /// - result-table schema mismatch between segments
    #[error("execution error: {0}")]
    Execution(String),

    /// Request decode or response encode failures.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard Basalt result alias.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Surface-visible error kinds attached in-band to a result table.
///
/// The numeric codes are part of the wire contract between server and broker
/// and must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryErrorCode {
    /// Request could not be decoded.
    InvalidArgument,
    /// Query execution failed after planning.
    QueryExecution,
    /// The requested table is not hosted on this server.
    ServerTableMissing,
    /// Scheduler wait already exceeded the query timeout.
    QuerySchedulingTimeout,
    /// Response could not be serialized.
    Internal,
}

impl QueryErrorCode {
    /// Stable numeric code carried on the wire.
    pub fn code(self) -> u32 {
        match self {
            QueryErrorCode::InvalidArgument => 100,
            QueryErrorCode::QueryExecution => 200,
            QueryErrorCode::ServerTableMissing => 230,
            QueryErrorCode::QuerySchedulingTimeout => 240,
            QueryErrorCode::Internal => 450,
        }
    }

    /// Stable symbolic name carried in broker responses and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            QueryErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            QueryErrorCode::QueryExecution => "QUERY_EXECUTION_ERROR",
            QueryErrorCode::ServerTableMissing => "SERVER_TABLE_MISSING_ERROR",
            QueryErrorCode::QuerySchedulingTimeout => "QUERY_SCHEDULING_TIMEOUT_ERROR",
            QueryErrorCode::Internal => "INTERNAL",
        }
    }
}

/// One in-band exception entry on a result table.
///
/// A query that fails mid-execution still completes with partial/empty data
/// plus one of these entries; only request decode and response serialization
/// are fatal to the request itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// Error kind.
    pub code: QueryErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl QueryError {
    /// Build an exception entry from a code and message.
    pub fn new(code: QueryErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Fatal-to-request failure surfaced to the transport layer.
///
/// Only two conditions abort a request instead of completing it with an
/// in-band exception: request decode (`InvalidArgument`) and response
/// delivery (`Internal`). The code gives the transport a stable mapping into
/// its own status space.
#[derive(Debug, Error)]
#[error("{}: {source}", .code.as_str())]
pub struct FatalQueryError {
    /// Error kind for transport status mapping.
    pub code: QueryErrorCode,
    /// Underlying failure.
    #[source]
    pub source: BasaltError,
}

impl FatalQueryError {
    /// Wraps a failure with its transport-visible code.
    pub fn new(code: QueryErrorCode, source: BasaltError) -> Self {
        Self { code, source }
    }
}
