use basalt_common::{BasaltError, ColumnType, ObjectValue, Result, Value};

use crate::expr::{Expression, FunctionCall};

use super::AggregationFunction;

fn type_mismatch(function: &FunctionCall, state: &Value) -> BasaltError {
    BasaltError::Execution(format!(
        "unexpected intermediate state for {function}: {state:?}"
    ))
}

/// `count(*)` / `count(col)`: long counter intermediate.
pub struct CountAggregationFunction {
    call: FunctionCall,
    inputs: Vec<Expression>,
}

impl CountAggregationFunction {
    pub fn new(call: FunctionCall) -> Self {
        // count(*) scans no inputs; the star argument is presentation only.
        let inputs = call
            .arguments
            .iter()
            .filter(|argument| !matches!(argument, Expression::Identifier(name) if name == "*"))
            .cloned()
            .collect();
        Self { call, inputs }
    }
}

impl AggregationFunction for CountAggregationFunction {
    fn result_column_name(&self) -> String {
        self.call.to_string()
    }

    fn input_expressions(&self) -> &[Expression] {
        &self.inputs
    }

    fn intermediate_result_column_type(&self) -> ColumnType {
        ColumnType::Long
    }

    fn final_result_column_type(&self) -> ColumnType {
        ColumnType::Long
    }

    fn init(&self) -> Value {
        Value::Long(0)
    }

    fn accept(&self, state: &mut Value, _input: &Value) -> Result<()> {
        match state {
            Value::Long(count) => {
                *count += 1;
                Ok(())
            }
            other => Err(type_mismatch(&self.call, other)),
        }
    }

    fn merge(&self, left: Value, right: Value) -> Result<Value> {
        match (&left, &right) {
            (Value::Long(a), Value::Long(b)) => Ok(Value::Long(a + b)),
            _ => Err(type_mismatch(&self.call, &left)),
        }
    }

    fn extract_final_result(&self, intermediate: Value) -> Result<Value> {
        match intermediate {
            Value::Long(_) => Ok(intermediate),
            other => Err(type_mismatch(&self.call, &other)),
        }
    }
}

macro_rules! double_fold_function {
    ($name:ident, $init:expr, $fold:expr) => {
        pub struct $name {
            call: FunctionCall,
            inputs: Vec<Expression>,
        }

        impl $name {
            pub fn new(call: FunctionCall) -> Self {
                let inputs = call.arguments.clone();
                Self { call, inputs }
            }
        }

        impl AggregationFunction for $name {
            fn result_column_name(&self) -> String {
                self.call.to_string()
            }

            fn input_expressions(&self) -> &[Expression] {
                &self.inputs
            }

            fn intermediate_result_column_type(&self) -> ColumnType {
                ColumnType::Double
            }

            fn final_result_column_type(&self) -> ColumnType {
                ColumnType::Double
            }

            fn init(&self) -> Value {
                Value::Double($init)
            }

            fn accept(&self, state: &mut Value, input: &Value) -> Result<()> {
                let Some(input) = input.as_f64() else {
                    // Nulls and non-numeric cells do not contribute.
                    return Ok(());
                };
                match state {
                    Value::Double(acc) => {
                        let fold: fn(f64, f64) -> f64 = $fold;
                        *acc = fold(*acc, input);
                        Ok(())
                    }
                    other => Err(type_mismatch(&self.call, other)),
                }
            }

            fn merge(&self, left: Value, right: Value) -> Result<Value> {
                match (&left, &right) {
                    (Value::Double(a), Value::Double(b)) => {
                        let fold: fn(f64, f64) -> f64 = $fold;
                        Ok(Value::Double(fold(*a, *b)))
                    }
                    _ => Err(type_mismatch(&self.call, &left)),
                }
            }

            fn extract_final_result(&self, intermediate: Value) -> Result<Value> {
                match intermediate {
                    Value::Double(_) => Ok(intermediate),
                    other => Err(type_mismatch(&self.call, &other)),
                }
            }
        }
    };
}

double_fold_function!(SumAggregationFunction, 0.0, |a, b| a + b);
double_fold_function!(MinAggregationFunction, f64::INFINITY, f64::min);
double_fold_function!(MaxAggregationFunction, f64::NEG_INFINITY, f64::max);

/// `avg(col)`: sum/count pair intermediate, non-comparable.
pub struct AvgAggregationFunction {
    call: FunctionCall,
    inputs: Vec<Expression>,
}

impl AvgAggregationFunction {
    pub fn new(call: FunctionCall) -> Self {
        let inputs = call.arguments.clone();
        Self { call, inputs }
    }
}

impl AggregationFunction for AvgAggregationFunction {
    fn result_column_name(&self) -> String {
        self.call.to_string()
    }

    fn input_expressions(&self) -> &[Expression] {
        &self.inputs
    }

    fn intermediate_result_column_type(&self) -> ColumnType {
        ColumnType::Object
    }

    fn final_result_column_type(&self) -> ColumnType {
        ColumnType::Double
    }

    fn is_intermediate_result_comparable(&self) -> bool {
        false
    }

    fn init(&self) -> Value {
        Value::Object(ObjectValue::AvgPair { sum: 0.0, count: 0 })
    }

    fn accept(&self, state: &mut Value, input: &Value) -> Result<()> {
        let Some(input) = input.as_f64() else {
            return Ok(());
        };
        match state {
            Value::Object(ObjectValue::AvgPair { sum, count }) => {
                *sum += input;
                *count += 1;
                Ok(())
            }
            other => Err(type_mismatch(&self.call, other)),
        }
    }

    fn merge(&self, left: Value, right: Value) -> Result<Value> {
        match (&left, &right) {
            (
                Value::Object(ObjectValue::AvgPair { sum: s1, count: c1 }),
                Value::Object(ObjectValue::AvgPair { sum: s2, count: c2 }),
            ) => Ok(Value::Object(ObjectValue::AvgPair {
                sum: s1 + s2,
                count: c1 + c2,
            })),
            _ => Err(type_mismatch(&self.call, &left)),
        }
    }

    fn extract_final_result(&self, intermediate: Value) -> Result<Value> {
        match intermediate {
            Value::Object(ObjectValue::AvgPair { count: 0, .. }) => {
                Ok(Value::Double(f64::NEG_INFINITY))
            }
            Value::Object(ObjectValue::AvgPair { sum, count }) => {
                Ok(Value::Double(sum / count as f64))
            }
            other => Err(type_mismatch(&self.call, &other)),
        }
    }
}

/// `minmaxrange(col)`: min/max pair intermediate, non-comparable; final is
/// `max - min`.
pub struct MinMaxRangeAggregationFunction {
    call: FunctionCall,
    inputs: Vec<Expression>,
}

impl MinMaxRangeAggregationFunction {
    pub fn new(call: FunctionCall) -> Self {
        let inputs = call.arguments.clone();
        Self { call, inputs }
    }
}

impl AggregationFunction for MinMaxRangeAggregationFunction {
    fn result_column_name(&self) -> String {
        self.call.to_string()
    }

    fn input_expressions(&self) -> &[Expression] {
        &self.inputs
    }

    fn intermediate_result_column_type(&self) -> ColumnType {
        ColumnType::Object
    }

    fn final_result_column_type(&self) -> ColumnType {
        ColumnType::Double
    }

    fn is_intermediate_result_comparable(&self) -> bool {
        false
    }

    fn init(&self) -> Value {
        Value::Object(ObjectValue::MinMaxPair {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        })
    }

    fn accept(&self, state: &mut Value, input: &Value) -> Result<()> {
        let Some(input) = input.as_f64() else {
            return Ok(());
        };
        match state {
            Value::Object(ObjectValue::MinMaxPair { min, max }) => {
                *min = min.min(input);
                *max = max.max(input);
                Ok(())
            }
            other => Err(type_mismatch(&self.call, other)),
        }
    }

    fn merge(&self, left: Value, right: Value) -> Result<Value> {
        match (&left, &right) {
            (
                Value::Object(ObjectValue::MinMaxPair { min: a1, max: b1 }),
                Value::Object(ObjectValue::MinMaxPair { min: a2, max: b2 }),
            ) => Ok(Value::Object(ObjectValue::MinMaxPair {
                min: a1.min(*a2),
                max: b1.max(*b2),
            })),
            _ => Err(type_mismatch(&self.call, &left)),
        }
    }

    fn extract_final_result(&self, intermediate: Value) -> Result<Value> {
        match intermediate {
            Value::Object(ObjectValue::MinMaxPair { min, max }) => Ok(Value::Double(max - min)),
            other => Err(type_mismatch(&self.call, &other)),
        }
    }
}
