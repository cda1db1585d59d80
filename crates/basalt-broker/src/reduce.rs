use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;

use basalt_common::{
    BasaltError, ColumnType, DataSchema, DataTable, ObjectValue, Result, Value,
};
use basalt_core::table::{table_trim_size, FinishedTable, IndexedTable, Record, DEFAULT_MIN_TRIM_SIZE};
use basalt_query::aggregation::aggregation_functions_for_query;
use basalt_query::{
    format_value, FilterContext, Predicate, PredicateOp, QueryContext, QueryOptions,
};
use tracing::debug;

use crate::response::{AggregationResult, BrokerResponse, GroupByResult, ResultTable};
use crate::trim::AggregationGroupByTrimmingService;

/// Merges per-server group-by tables into the final broker response.
///
/// Routing follows the `(groupByMode, responseFormat)` dials: the SQL
/// pipeline rebuilds an indexed table from the server blocks and iterates it
/// in order, while the legacy pipeline merges per-aggregation group maps and
/// trims them by final value.
pub struct GroupByBrokerReducer {
    query: QueryContext,
    sql_query: bool,
}

impl GroupByBrokerReducer {
    /// `sql_query` marks a natively-SQL broker query, which gets its result
    /// columns reordered to match the select expressions.
    pub fn new(query: QueryContext, sql_query: bool) -> Result<Self> {
        if query.group_by_expressions.is_none() {
            return Err(BasaltError::BadQuery(
                "group-by reducer over a query without group-by expressions".to_string(),
            ));
        }
        Ok(Self { query, sql_query })
    }

    /// Reduces the per-server tables into one response.
    pub fn reduce(&self, data_tables: Vec<DataTable>) -> Result<BrokerResponse> {
        let options = QueryOptions::new(&self.query.query_options);
        let group_by_mode_sql = options.is_group_by_mode_sql();
        let response_format_sql = options.is_response_format_sql();
        let preserve_type = options.is_preserve_type();

        let mut response = BrokerResponse::default();
        for table in &data_tables {
            response.exceptions.extend(table.exceptions.iter().cloned());
        }
        // Error/empty responses carry no schema and nothing to merge.
        let data_tables: Vec<DataTable> = data_tables
            .into_iter()
            .filter(|table| table.schema.is_some())
            .collect();
        debug!(
            tables = data_tables.len(),
            group_by_mode_sql, response_format_sql, "reducing group-by tables"
        );

        if group_by_mode_sql {
            if response_format_sql {
                self.set_sql_group_by_result_table(&mut response, data_tables)?;
            } else {
                self.set_sql_group_by_aggregation_results(
                    &mut response,
                    data_tables,
                    preserve_type,
                )?;
            }
        } else {
            self.set_legacy_group_by_results(
                &mut response,
                data_tables,
                response_format_sql,
                preserve_type,
            )?;
        }
        Ok(response)
    }

    /// Rebuilds the indexed table from the server blocks and freezes it in
    /// order-by order.
    fn finished_indexed_table(
        &self,
        data_tables: Vec<DataTable>,
    ) -> Result<Option<FinishedTable>> {
        let Some(schema) = data_tables.first().and_then(|table| table.schema.clone()) else {
            return Ok(None);
        };
        let functions = aggregation_functions_for_query(&self.query)?;
        let trim_to_size = table_trim_size(self.query.limit, DEFAULT_MIN_TRIM_SIZE);
        let table = IndexedTable::new(
            schema,
            functions,
            self.query.order_by_expressions.as_deref(),
            trim_to_size,
            None,
        )?;
        for mut data_table in data_tables {
            for row in mem::take(&mut data_table.rows) {
                table.upsert(Record::new(row))?;
            }
        }
        Ok(Some(table.finish(true)?))
    }

    /// groupByMode = sql, responseFormat = sql: the tabular result.
    fn set_sql_group_by_result_table(
        &self,
        response: &mut BrokerResponse,
        data_tables: Vec<DataTable>,
    ) -> Result<()> {
        let functions = aggregation_functions_for_query(&self.query)?;
        let Some(finished) = self.finished_indexed_table(data_tables)? else {
            return Ok(());
        };
        let schema = finished.schema().clone();
        let num_key_columns = schema.num_key_columns();

        // Aggregation columns present their final-result types.
        let mut final_types = schema.column_types().to_vec();
        for (i, function) in functions.iter().enumerate() {
            final_types[num_key_columns + i] = function.final_result_column_type();
        }
        let final_schema = DataSchema::new(
            schema.column_names().to_vec(),
            final_types,
            num_key_columns,
        );

        let mut rows: Vec<Vec<Value>> = Vec::new();
        for record in finished.records() {
            if rows.len() >= self.query.limit {
                break;
            }
            let mut values = record.values.clone();
            for (i, function) in functions.iter().enumerate() {
                let index = num_key_columns + i;
                let intermediate = mem::replace(&mut values[index], Value::Null);
                values[index] = function.extract_final_result(intermediate)?;
            }
            if let Some(having) = &self.query.having_filter {
                if !having_matches(having, &final_schema, &values)? {
                    continue;
                }
            }
            rows.push(values);
        }

        let (result_schema, rows) = if self.sql_query {
            let index_map = self.select_expression_index_map(num_key_columns)?;
            reorder_columns(&final_schema, rows, &index_map)
        } else {
            (final_schema, rows)
        };
        response.result_table = Some(ResultTable {
            schema: result_schema,
            rows,
        });
        Ok(())
    }

    /// groupByMode = sql, responseFormat = pql: SQL execution semantics
    /// presented as per-aggregation lists sharing the same groups.
    fn set_sql_group_by_aggregation_results(
        &self,
        response: &mut BrokerResponse,
        data_tables: Vec<DataTable>,
        preserve_type: bool,
    ) -> Result<()> {
        let functions = aggregation_functions_for_query(&self.query)?;
        let Some(finished) = self.finished_indexed_table(data_tables)? else {
            return Ok(());
        };
        let schema = finished.schema();
        let num_key_columns = schema.num_key_columns();
        let group_by_columns: Vec<String> = schema.column_names()[..num_key_columns].to_vec();

        let mut result_lists: Vec<Vec<GroupByResult>> = vec![Vec::new(); functions.len()];
        for record in finished.records().iter().take(self.query.limit) {
            let group: Vec<String> = record.values[..num_key_columns]
                .iter()
                .map(Value::to_string)
                .collect();
            for (i, function) in functions.iter().enumerate() {
                let final_value =
                    function.extract_final_result(record.values[num_key_columns + i].clone())?;
                let value = if preserve_type {
                    final_value
                } else {
                    Value::String(format_value(&final_value))
                };
                result_lists[i].push(GroupByResult {
                    group: group.clone(),
                    value,
                });
            }
        }

        response.aggregation_results = functions
            .iter()
            .zip(result_lists)
            .map(|(function, group_by_results)| AggregationResult {
                function: function.result_column_name(),
                group_by_columns: group_by_columns.clone(),
                group_by_results,
            })
            .collect();
        Ok(())
    }

    /// groupByMode = pql: legacy per-aggregation merge, then trim.
    fn set_legacy_group_by_results(
        &self,
        response: &mut BrokerResponse,
        data_tables: Vec<DataTable>,
        response_format_sql: bool,
        preserve_type: bool,
    ) -> Result<()> {
        let functions = aggregation_functions_for_query(&self.query)?;
        let group_by = self.query.group_by_expressions.as_ref().ok_or_else(|| {
            BasaltError::BadQuery("legacy group-by reduce without group-by".to_string())
        })?;

        let mut merged: Vec<BTreeMap<String, Value>> =
            functions.iter().map(|_| BTreeMap::new()).collect();
        for mut data_table in data_tables {
            for (i, function) in functions.iter().enumerate() {
                let Some(row) = data_table.rows.get_mut(i) else {
                    continue;
                };
                if row.len() < 2 {
                    return Err(BasaltError::Execution(
                        "legacy group-by block row is too narrow".to_string(),
                    ));
                }
                let Value::Object(ObjectValue::GroupMap(map)) =
                    mem::replace(&mut row[1], Value::Null)
                else {
                    return Err(BasaltError::Execution(
                        "legacy group-by block without a group map".to_string(),
                    ));
                };
                for (group_key, incoming) in map {
                    if let Some(existing) = merged[i].remove(&group_key) {
                        let value = function.merge(existing, incoming)?;
                        merged[i].insert(group_key, value);
                    } else {
                        merged[i].insert(group_key, incoming);
                    }
                }
            }
        }

        let mut final_maps = Vec::with_capacity(functions.len());
        for (function, intermediate_map) in functions.iter().zip(merged) {
            let mut final_map = BTreeMap::new();
            for (group_key, intermediate) in intermediate_map {
                final_map.insert(group_key, function.extract_final_result(intermediate)?);
            }
            final_maps.push(final_map);
        }
        let trimming_service = AggregationGroupByTrimmingService::new(self.query.limit);
        let mut result_lists = trimming_service.trim_final_results(final_maps);

        if response_format_sql {
            // Multiple aggregations violate the tabular shape in this mode.
            if functions.len() != 1 {
                return Err(BasaltError::BadQuery(
                    "groupByMode=pql with responseFormat=sql supports exactly one aggregation"
                        .to_string(),
                ));
            }
            let mut column_names: Vec<String> =
                group_by.iter().map(|e| e.to_string()).collect();
            let mut column_types = vec![ColumnType::String; group_by.len()];
            column_names.push(functions[0].result_column_name());
            column_types.push(functions[0].final_result_column_type());
            let schema = DataSchema::new(column_names, column_types, group_by.len());

            let rows = result_lists
                .remove(0)
                .into_iter()
                .map(|result| {
                    let mut row: Vec<Value> = result
                        .group
                        .into_iter()
                        .map(Value::String)
                        .collect();
                    row.push(result.value);
                    row
                })
                .collect();
            response.result_table = Some(ResultTable { schema, rows });
        } else {
            if !preserve_type {
                for result_list in &mut result_lists {
                    for result in result_list {
                        result.value = Value::String(format_value(&result.value));
                    }
                }
            }
            let group_by_columns: Vec<String> =
                group_by.iter().map(|e| e.to_string()).collect();
            response.aggregation_results = functions
                .iter()
                .zip(result_lists)
                .map(|(function, group_by_results)| AggregationResult {
                    function: function.result_column_name(),
                    group_by_columns: group_by_columns.clone(),
                    group_by_results,
                })
                .collect();
        }
        Ok(())
    }

    /// Maps each select expression to its column in the reduced schema:
    /// identifiers to their group-by position, aggregations to successive
    /// positions after the key columns.
    fn select_expression_index_map(&self, num_key_columns: usize) -> Result<Vec<usize>> {
        let group_by = self.query.group_by_expressions.as_ref().ok_or_else(|| {
            BasaltError::BadQuery("select reorder without group-by".to_string())
        })?;
        let mut aggregation_index = num_key_columns;
        let mut index_map = Vec::with_capacity(self.query.select_expressions.len());
        for select_expression in &self.query.select_expressions {
            if select_expression.is_aggregation() {
                index_map.push(aggregation_index);
                aggregation_index += 1;
            } else {
                let position = group_by
                    .iter()
                    .position(|expression| expression == select_expression)
                    .ok_or_else(|| {
                        BasaltError::BadQuery(format!(
                            "select expression: {select_expression} is not an aggregation and not contained in the group-by expressions"
                        ))
                    })?;
                index_map.push(position);
            }
        }
        Ok(index_map)
    }
}

fn reorder_columns(
    schema: &DataSchema,
    rows: Vec<Vec<Value>>,
    index_map: &[usize],
) -> (DataSchema, Vec<Vec<Value>>) {
    let column_names = index_map
        .iter()
        .map(|&i| schema.column_name(i).to_string())
        .collect();
    let column_types = index_map.iter().map(|&i| schema.column_type(i)).collect();
    // Reordering interleaves key and aggregation columns; the result is
    // presentation-only and carries no key split.
    let reordered_schema = DataSchema::new(column_names, column_types, 0);
    let reordered_rows = rows
        .into_iter()
        .map(|row| index_map.iter().map(|&i| row[i].clone()).collect())
        .collect();
    (reordered_schema, reordered_rows)
}

/// Evaluates a having filter over one final (extracted) row.
fn having_matches(filter: &FilterContext, schema: &DataSchema, row: &[Value]) -> Result<bool> {
    match filter {
        FilterContext::And(children) => {
            for child in children {
                if !having_matches(child, schema, row)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterContext::Or(children) => {
            for child in children {
                if having_matches(child, schema, row)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterContext::Predicate(predicate) => having_predicate_matches(predicate, schema, row),
    }
}

fn having_predicate_matches(
    predicate: &Predicate,
    schema: &DataSchema,
    row: &[Value],
) -> Result<bool> {
    let column_name = predicate.lhs.to_string();
    let index = schema.index_of(&column_name).ok_or_else(|| {
        BasaltError::BadQuery(format!(
            "having expression {column_name} is not in the result schema"
        ))
    })?;
    let lhs = &row[index];
    let first = || {
        predicate.values.first().ok_or_else(|| {
            BasaltError::BadQuery(format!("having predicate on {column_name} has no value"))
        })
    };
    Ok(match predicate.op {
        PredicateOp::Eq => lhs.compare(first()?) == Ordering::Equal,
        PredicateOp::NotEq => lhs.compare(first()?) != Ordering::Equal,
        PredicateOp::Gt => lhs.compare(first()?) == Ordering::Greater,
        PredicateOp::Ge => lhs.compare(first()?) != Ordering::Less,
        PredicateOp::Lt => lhs.compare(first()?) == Ordering::Less,
        PredicateOp::Le => lhs.compare(first()?) != Ordering::Greater,
        PredicateOp::Between => match predicate.values.as_slice() {
            [low, high, ..] => {
                lhs.compare(low) != Ordering::Less && lhs.compare(high) != Ordering::Greater
            }
            _ => {
                return Err(BasaltError::BadQuery(format!(
                    "having between on {column_name} needs two bounds"
                )))
            }
        },
        PredicateOp::In => predicate
            .values
            .iter()
            .any(|value| lhs.compare(value) == Ordering::Equal),
        PredicateOp::NotIn => predicate
            .values
            .iter()
            .all(|value| lhs.compare(value) != Ordering::Equal),
    })
}
