//! Aggregation-function capability interface and registry.
//!
//! An aggregation function is a capability set over one intermediate type:
//! per-row accumulation, associative merge, and final-result extraction.
//! Concrete functions are resolved from a name-keyed registry; the merge path
//! never inspects intermediates directly.

mod functions;

use basalt_common::{BasaltError, ColumnType, Result, Value};

use crate::context::QueryContext;
use crate::expr::{Expression, FunctionCall, FunctionKind};

pub use functions::{
    AvgAggregationFunction, CountAggregationFunction, MaxAggregationFunction,
    MinAggregationFunction, MinMaxRangeAggregationFunction, SumAggregationFunction,
};

/// Capability interface of one aggregation function.
///
/// Intermediates are ordinary [`Value`]s; functions with non-scalar state use
/// `Value::Object` and report `is_intermediate_result_comparable() == false`,
/// which makes ranking extract the final result before comparing.
pub trait AggregationFunction: Send + Sync {
    /// Result column name, e.g. `sum(n)`.
    fn result_column_name(&self) -> String;

    /// Input expressions evaluated per row; empty for `count(*)`.
    fn input_expressions(&self) -> &[Expression];

    /// Column type of the intermediate result on the wire.
    fn intermediate_result_column_type(&self) -> ColumnType;

    /// Column type of the extracted final result.
    fn final_result_column_type(&self) -> ColumnType;

    /// Whether intermediates order meaningfully without final extraction.
    fn is_intermediate_result_comparable(&self) -> bool {
        true
    }

    /// Fresh intermediate state.
    fn init(&self) -> Value;

    /// Folds one row's input into the intermediate state.
    fn accept(&self, state: &mut Value, input: &Value) -> Result<()>;

    /// Associative merge of two intermediates.
    fn merge(&self, left: Value, right: Value) -> Result<Value>;

    /// Extracts the externally visible final result.
    fn extract_final_result(&self, intermediate: Value) -> Result<Value>;
}

/// Resolves a concrete function from an aggregation call.
pub fn from_function(call: &FunctionCall) -> Result<Box<dyn AggregationFunction>> {
    if call.kind != FunctionKind::Aggregation {
        return Err(BasaltError::BadQuery(format!(
            "not an aggregation function: {call}"
        )));
    }
    match call.name.as_str() {
        "count" => Ok(Box::new(CountAggregationFunction::new(call.clone()))),
        "sum" => Ok(Box::new(SumAggregationFunction::new(call.clone()))),
        "min" => Ok(Box::new(MinAggregationFunction::new(call.clone()))),
        "max" => Ok(Box::new(MaxAggregationFunction::new(call.clone()))),
        "avg" => Ok(Box::new(AvgAggregationFunction::new(call.clone()))),
        "minmaxrange" => Ok(Box::new(MinMaxRangeAggregationFunction::new(call.clone()))),
        other => Err(BasaltError::BadQuery(format!(
            "unknown aggregation function: {other}"
        ))),
    }
}

/// Resolves the query's aggregation functions: every aggregation call in the
/// select clause, then order-by aggregations not already selected.
pub fn aggregation_functions_for_query(
    query: &QueryContext,
) -> Result<Vec<Box<dyn AggregationFunction>>> {
    let mut seen: Vec<&FunctionCall> = Vec::new();
    let mut functions = Vec::new();
    for expression in &query.select_expressions {
        if let Some(call) = expression.function() {
            if call.kind == FunctionKind::Aggregation {
                seen.push(call);
                functions.push(from_function(call)?);
            }
        }
    }
    for order_by in query.order_by_expressions.iter().flatten() {
        if let Some(call) = order_by.expression.function() {
            if call.kind == FunctionKind::Aggregation && !seen.contains(&call) {
                seen.push(call);
                functions.push(from_function(call)?);
            }
        }
    }
    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::OrderByExpression;

    #[test]
    fn resolves_known_functions() {
        let call = FunctionCall {
            kind: FunctionKind::Aggregation,
            name: "sum".to_string(),
            arguments: vec![Expression::identifier("n")],
        };
        let function = from_function(&call).expect("sum resolves");
        assert_eq!(function.result_column_name(), "sum(n)");
    }

    #[test]
    fn rejects_unknown_functions() {
        let call = FunctionCall {
            kind: FunctionKind::Aggregation,
            name: "percentile99".to_string(),
            arguments: vec![Expression::identifier("n")],
        };
        assert!(matches!(from_function(&call), Err(BasaltError::BadQuery(_))));
    }

    #[test]
    fn query_functions_include_order_by_only_aggregations() {
        let query = QueryContext::builder(vec![
            Expression::identifier("city"),
            Expression::aggregation("sum", vec![Expression::identifier("n")]),
        ])
        .group_by(vec![Expression::identifier("city")])
        .order_by(vec![
            OrderByExpression::desc(Expression::aggregation(
                "sum",
                vec![Expression::identifier("n")],
            )),
            OrderByExpression::asc(Expression::aggregation(
                "max",
                vec![Expression::identifier("n")],
            )),
        ])
        .build();
        let functions = aggregation_functions_for_query(&query).expect("resolve");
        let names: Vec<_> = functions
            .iter()
            .map(|function| function.result_column_name())
            .collect();
        assert_eq!(names, vec!["sum(n)".to_string(), "max(n)".to_string()]);
    }
}
