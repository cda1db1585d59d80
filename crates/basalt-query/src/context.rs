use std::collections::{HashMap, HashSet};

use basalt_common::{BasaltError, Result};
use serde::{Deserialize, Serialize};

use crate::expr::{Expression, FilterContext, OrderByExpression};

/// Default result-set limit when the query names none.
pub const DEFAULT_LIMIT: usize = 10;

/// Normalized, compiled query shape as it arrives at a server.
///
/// Parsing and compilation happen at the broker; a server only validates the
/// shape invariants it relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// Select expressions, ordered.
    pub select_expressions: Vec<Expression>,
    /// Optional filter tree.
    #[serde(default)]
    pub filter: Option<FilterContext>,
    /// Optional group-by expressions, ordered.
    #[serde(default)]
    pub group_by_expressions: Option<Vec<Expression>>,
    /// Optional order-by expressions, ordered.
    #[serde(default)]
    pub order_by_expressions: Option<Vec<OrderByExpression>>,
    /// Optional having filter, applied over final aggregation values.
    #[serde(default)]
    pub having_filter: Option<FilterContext>,
    /// Result-set limit.
    pub limit: usize,
    /// Raw query options (`timeoutMs`, `groupByMode`, ...).
    #[serde(default)]
    pub query_options: HashMap<String, String>,
}

impl QueryContext {
    /// Starts a builder with the given select expressions.
    pub fn builder(select_expressions: Vec<Expression>) -> QueryContextBuilder {
        QueryContextBuilder {
            context: QueryContext {
                select_expressions,
                filter: None,
                group_by_expressions: None,
                order_by_expressions: None,
                having_filter: None,
                limit: DEFAULT_LIMIT,
                query_options: HashMap::new(),
            },
        }
    }

    /// Whether this is an aggregation query: any aggregation call in the
    /// select clause or the order-by clause.
    pub fn is_aggregation_query(&self) -> bool {
        if self.select_expressions.iter().any(Expression::is_aggregation) {
            return true;
        }
        self.order_by_expressions
            .iter()
            .flatten()
            .any(|order_by| order_by.expression.is_aggregation())
    }

    /// All columns (identifier expressions) referenced anywhere in the query.
    pub fn all_columns(&self) -> HashSet<String> {
        let mut columns = HashSet::new();
        for expression in &self.select_expressions {
            expression.collect_columns(&mut columns);
        }
        if let Some(filter) = &self.filter {
            filter.collect_columns(&mut columns);
        }
        for expression in self.group_by_expressions.iter().flatten() {
            expression.collect_columns(&mut columns);
        }
        for order_by in self.order_by_expressions.iter().flatten() {
            order_by.expression.collect_columns(&mut columns);
        }
        if let Some(having) = &self.having_filter {
            having.collect_columns(&mut columns);
        }
        columns
    }

    /// Checks shape invariants the execution path relies on.
    ///
    /// Every order-by expression must either be one of the group-by
    /// expressions or an aggregation call.
    pub fn validate(&self) -> Result<()> {
        if let Some(order_by_expressions) = &self.order_by_expressions {
            if let Some(group_by_expressions) = &self.group_by_expressions {
                for order_by in order_by_expressions {
                    let in_group_by = group_by_expressions.contains(&order_by.expression);
                    if !in_group_by && !order_by.expression.is_aggregation() {
                        return Err(BasaltError::BadQuery(format!(
                            "order-by expression: {} is neither a group-by expression nor an aggregation",
                            order_by.expression
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`QueryContext`].
#[derive(Debug, Clone)]
pub struct QueryContextBuilder {
    context: QueryContext,
}

impl QueryContextBuilder {
    pub fn filter(mut self, filter: FilterContext) -> Self {
        self.context.filter = Some(filter);
        self
    }

    pub fn group_by(mut self, expressions: Vec<Expression>) -> Self {
        self.context.group_by_expressions = Some(expressions);
        self
    }

    pub fn order_by(mut self, expressions: Vec<OrderByExpression>) -> Self {
        self.context.order_by_expressions = Some(expressions);
        self
    }

    pub fn having(mut self, filter: FilterContext) -> Self {
        self.context.having_filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.context.limit = limit;
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context
            .query_options
            .insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> QueryContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::OrderByExpression;

    #[test]
    fn aggregation_predicate_covers_order_by() {
        let query = QueryContext::builder(vec![Expression::identifier("city")])
            .order_by(vec![OrderByExpression::desc(Expression::aggregation(
                "sum",
                vec![Expression::identifier("n")],
            ))])
            .build();
        assert!(query.is_aggregation_query());

        let plain = QueryContext::builder(vec![Expression::identifier("city")]).build();
        assert!(!plain.is_aggregation_query());
    }

    #[test]
    fn validate_rejects_unanchored_order_by() {
        let query = QueryContext::builder(vec![
            Expression::identifier("city"),
            Expression::aggregation("sum", vec![Expression::identifier("n")]),
        ])
        .group_by(vec![Expression::identifier("city")])
        .order_by(vec![OrderByExpression::asc(Expression::identifier(
            "other",
        ))])
        .build();
        assert!(query.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        use crate::expr::{FilterContext, PredicateOp};
        use basalt_common::Value;
        let query = QueryContext::builder(vec![
            Expression::identifier("city"),
            Expression::aggregation("sum", vec![Expression::identifier("n")]),
        ])
        .filter(FilterContext::predicate(
            Expression::identifier("n"),
            PredicateOp::Gt,
            vec![Value::Long(0)],
        ))
        .group_by(vec![Expression::identifier("city")])
        .order_by(vec![OrderByExpression::desc(Expression::aggregation(
            "sum",
            vec![Expression::identifier("n")],
        ))])
        .limit(5)
        .option("groupByMode", "sql")
        .build();

        let encoded = serde_json::to_string(&query).expect("encode");
        let decoded: QueryContext = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, query);
    }

    #[test]
    fn validate_accepts_group_by_and_aggregation_order_by() {
        let query = QueryContext::builder(vec![
            Expression::identifier("city"),
            Expression::aggregation("sum", vec![Expression::identifier("n")]),
        ])
        .group_by(vec![Expression::identifier("city")])
        .order_by(vec![
            OrderByExpression::asc(Expression::identifier("city")),
            OrderByExpression::desc(Expression::aggregation(
                "sum",
                vec![Expression::identifier("n")],
            )),
        ])
        .build();
        query.validate().expect("valid order-by");
    }
}
