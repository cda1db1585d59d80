use std::collections::HashMap;

use basalt_common::{BasaltError, Result};
use serde::{Deserialize, Serialize};

use crate::expr::{Expression, FunctionCall, FunctionKind};

/// Separator joining multi-argument encodings in the legacy wire form.
pub const AGGREGATION_FUNCTION_ARG_SEPARATOR: char = '\t';

/// Params key carrying the joined argument string in the legacy wire form.
pub const COLUMN_KEY_IN_AGGREGATION_INFO: &str = "column";

/// Group-key component separator used by the legacy group-by payload.
pub const GROUP_KEY_DELIMITER: char = '\t';

/// Aggregation clause as it appears in an instance request.
///
/// Newer brokers populate `expressions`; older ones send the arguments joined
/// under `aggregationParams["column"]`. Both encodings are accepted so that
/// servers can be upgraded before brokers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationInfo {
    /// Function name, e.g. `sum`.
    #[serde(rename = "aggregationType")]
    pub aggregation_type: String,
    /// New-style ordered argument list.
    #[serde(default)]
    pub expressions: Option<Vec<String>>,
    /// Legacy params mapping.
    #[serde(rename = "aggregationParams", default)]
    pub aggregation_params: HashMap<String, String>,
}

impl AggregationInfo {
    /// Ordered argument strings, from whichever encoding is present.
    pub fn arguments(&self) -> Result<Vec<String>> {
        if let Some(expressions) = &self.expressions {
            return Ok(expressions.clone());
        }
        let column = self
            .aggregation_params
            .get(COLUMN_KEY_IN_AGGREGATION_INFO)
            .ok_or_else(|| {
                BasaltError::BadQuery(format!(
                    "aggregation {} carries neither expressions nor aggregationParams[{}]",
                    self.aggregation_type, COLUMN_KEY_IN_AGGREGATION_INFO
                ))
            })?;
        Ok(column
            .split(AGGREGATION_FUNCTION_ARG_SEPARATOR)
            .map(str::to_string)
            .collect())
    }

    /// Compiles this clause into an aggregation expression. Argument strings
    /// are column references; transform compilation happens upstream.
    pub fn to_expression(&self) -> Result<Expression> {
        let arguments = self
            .arguments()?
            .into_iter()
            .map(Expression::Identifier)
            .collect();
        Ok(Expression::Function(FunctionCall {
            kind: FunctionKind::Aggregation,
            name: self.aggregation_type.to_ascii_lowercase(),
            arguments,
        }))
    }
}

/// Joins arguments into the legacy single-string encoding.
pub fn concat_args(arguments: &[String]) -> String {
    if arguments.len() > 1 {
        arguments.join(&AGGREGATION_FUNCTION_ARG_SEPARATOR.to_string())
    } else {
        arguments.first().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_new_style_expressions() {
        let info = AggregationInfo {
            aggregation_type: "sum".to_string(),
            expressions: Some(vec!["n".to_string()]),
            aggregation_params: HashMap::from([(
                "column".to_string(),
                "ignored".to_string(),
            )]),
        };
        assert_eq!(info.arguments().unwrap(), vec!["n".to_string()]);
    }

    #[test]
    fn falls_back_to_joined_params() {
        let info = AggregationInfo {
            aggregation_type: "distinct".to_string(),
            expressions: None,
            aggregation_params: HashMap::from([(
                "column".to_string(),
                format!("a{}b", AGGREGATION_FUNCTION_ARG_SEPARATOR),
            )]),
        };
        assert_eq!(
            info.arguments().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn rejects_missing_encodings() {
        let info = AggregationInfo {
            aggregation_type: "sum".to_string(),
            expressions: None,
            aggregation_params: HashMap::new(),
        };
        assert!(info.arguments().is_err());
    }

    #[test]
    fn compiles_into_an_aggregation_expression() {
        let info = AggregationInfo {
            aggregation_type: "SUM".to_string(),
            expressions: Some(vec!["n".to_string()]),
            aggregation_params: HashMap::new(),
        };
        let expression = info.to_expression().unwrap();
        assert!(expression.is_aggregation());
        assert_eq!(expression.to_string(), "sum(n)");
    }

    #[test]
    fn concat_round_trips() {
        let arguments = vec!["a".to_string(), "b".to_string()];
        let joined = concat_args(&arguments);
        let info = AggregationInfo {
            aggregation_type: "sum".to_string(),
            expressions: None,
            aggregation_params: HashMap::from([("column".to_string(), joined)]),
        };
        assert_eq!(info.arguments().unwrap(), arguments);
    }
}
