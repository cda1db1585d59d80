use std::collections::HashSet;
use std::fmt;

use basalt_common::Value;
use serde::{Deserialize, Serialize};

/// Whether a function call aggregates across rows or transforms one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Aggregation,
    Transform,
}

/// One function call inside a query expression.
///
/// `name` is canonical lower-case; the broker normalizes case before the
/// request reaches a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionCall {
    pub kind: FunctionKind,
    pub name: String,
    pub arguments: Vec<Expression>,
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, argument) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{argument}")?;
        }
        write!(f, ")")
    }
}

/// A compiled query expression: a column reference, a literal, or a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expression {
    Identifier(String),
    Literal(Value),
    Function(FunctionCall),
}

impl Expression {
    /// Shorthand for a column reference.
    pub fn identifier(name: impl Into<String>) -> Self {
        Expression::Identifier(name.into())
    }

    /// Shorthand for an aggregation call over the given arguments.
    pub fn aggregation(name: impl Into<String>, arguments: Vec<Expression>) -> Self {
        Expression::Function(FunctionCall {
            kind: FunctionKind::Aggregation,
            name: name.into().to_ascii_lowercase(),
            arguments,
        })
    }

    /// The function call, when this expression is one.
    pub fn function(&self) -> Option<&FunctionCall> {
        match self {
            Expression::Function(call) => Some(call),
            _ => None,
        }
    }

    /// Whether this expression is an aggregation call.
    pub fn is_aggregation(&self) -> bool {
        matches!(
            self,
            Expression::Function(FunctionCall {
                kind: FunctionKind::Aggregation,
                ..
            })
        )
    }

    /// Collects every identifier referenced by this expression.
    pub fn collect_columns(&self, columns: &mut HashSet<String>) {
        match self {
            Expression::Identifier(name) => {
                columns.insert(name.clone());
            }
            Expression::Literal(_) => {}
            Expression::Function(call) => {
                for argument in &call.arguments {
                    argument.collect_columns(columns);
                }
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Identifier(name) => write!(f, "{name}"),
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::Function(call) => write!(f, "{call}"),
        }
    }
}

/// One order-by clause entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderByExpression {
    pub expression: Expression,
    pub ascending: bool,
}

impl OrderByExpression {
    pub fn asc(expression: Expression) -> Self {
        Self {
            expression,
            ascending: true,
        }
    }

    pub fn desc(expression: Expression) -> Self {
        Self {
            expression,
            ascending: false,
        }
    }
}

/// Comparison operators supported by predicate leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredicateOp {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    /// Inclusive range; `values[0]` is the lower bound, `values[1]` the upper.
    Between,
    In,
    NotIn,
}

/// One predicate leaf of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub lhs: Expression,
    pub op: PredicateOp,
    pub values: Vec<Value>,
}

/// Compiled filter tree attached to a query.
///
/// The expression compiler lives outside this crate; by the time a filter
/// reaches a server it is already this normalized and/or/predicate shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterContext {
    And(Vec<FilterContext>),
    Or(Vec<FilterContext>),
    Predicate(Predicate),
}

impl FilterContext {
    /// Shorthand for a single-predicate filter.
    pub fn predicate(lhs: Expression, op: PredicateOp, values: Vec<Value>) -> Self {
        FilterContext::Predicate(Predicate { lhs, op, values })
    }

    /// Collects every identifier referenced by this filter.
    pub fn collect_columns(&self, columns: &mut HashSet<String>) {
        match self {
            FilterContext::And(children) | FilterContext::Or(children) => {
                for child in children {
                    child.collect_columns(columns);
                }
            }
            FilterContext::Predicate(predicate) => predicate.lhs.collect_columns(columns),
        }
    }
}
