use basalt_common::{DataSchema, QueryError, Value};
use serde::{Deserialize, Serialize};

/// Tabular broker response body (`responseFormat = sql`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    /// Final column layout, in select order for SQL queries.
    pub schema: DataSchema,
    /// Final rows, limited and in presentation order.
    pub rows: Vec<Vec<Value>>,
}

/// One group's value for one aggregation function (legacy presentation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByResult {
    /// Group-by key components, stringified.
    pub group: Vec<String>,
    /// Final aggregation value; a formatted string when `preserveType` is
    /// off.
    pub value: Value,
}

/// Per-aggregation result list (legacy presentation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Aggregation column name, e.g. `sum(n)`.
    pub function: String,
    /// Group-by column names shared by every entry.
    #[serde(rename = "groupByColumns")]
    pub group_by_columns: Vec<String>,
    /// One entry per surviving group, best first.
    #[serde(rename = "groupByResult")]
    pub group_by_results: Vec<GroupByResult>,
}

/// Final broker response: exactly one presentation is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerResponse {
    /// Tabular presentation.
    #[serde(rename = "resultTable", default)]
    pub result_table: Option<ResultTable>,
    /// Per-aggregation presentation.
    #[serde(rename = "aggregationResults", default)]
    pub aggregation_results: Vec<AggregationResult>,
    /// Exceptions gathered from the server tables.
    #[serde(default)]
    pub exceptions: Vec<QueryError>,
}
