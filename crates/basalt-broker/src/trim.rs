use std::cmp::Ordering;
use std::collections::BTreeMap;

use basalt_common::Value;
use basalt_core::table::{table_trim_size, DEFAULT_MIN_TRIM_SIZE};
use basalt_query::legacy::GROUP_KEY_DELIMITER;

use crate::response::GroupByResult;

/// Trims legacy (per-aggregation) group-by results down to the query limit.
///
/// Ranking is by final value, descending, with the group-key string as the
/// deterministic secondary. The intermediate trim size leaves headroom above
/// the limit so cross-server merges do not lose contenders early.
pub struct AggregationGroupByTrimmingService {
    limit: usize,
    trim_size: usize,
}

impl AggregationGroupByTrimmingService {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            trim_size: table_trim_size(limit, DEFAULT_MIN_TRIM_SIZE),
        }
    }

    /// Intermediate trim applied to a merged map before final extraction.
    pub fn trim_size(&self) -> usize {
        self.trim_size
    }

    /// Ranks each final-result map and keeps the top `limit` groups.
    pub fn trim_final_results(
        &self,
        final_maps: Vec<BTreeMap<String, Value>>,
    ) -> Vec<Vec<GroupByResult>> {
        final_maps
            .into_iter()
            .map(|final_map| {
                let mut entries: Vec<(String, Value)> = final_map.into_iter().collect();
                entries.sort_by(|(key_a, value_a), (key_b, value_b)| {
                    match value_b.compare(value_a) {
                        Ordering::Equal => key_a.cmp(key_b),
                        ordering => ordering,
                    }
                });
                entries.truncate(self.limit);
                entries
                    .into_iter()
                    .map(|(group_key, value)| GroupByResult {
                        group: group_key
                            .split(GROUP_KEY_DELIMITER)
                            .map(str::to_string)
                            .collect(),
                        value,
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_top_limit_by_value_descending() {
        let mut map = BTreeMap::new();
        for i in 0..10 {
            map.insert(format!("g{i}"), Value::Double(i as f64));
        }
        let service = AggregationGroupByTrimmingService::new(3);
        let trimmed = service.trim_final_results(vec![map]);
        assert_eq!(trimmed.len(), 1);
        let values: Vec<&Value> = trimmed[0].iter().map(|r| &r.value).collect();
        assert_eq!(
            values,
            vec![
                &Value::Double(9.0),
                &Value::Double(8.0),
                &Value::Double(7.0)
            ]
        );
    }

    #[test]
    fn ties_break_on_group_key() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::Double(1.0));
        map.insert("a".to_string(), Value::Double(1.0));
        let trimmed = AggregationGroupByTrimmingService::new(2).trim_final_results(vec![map]);
        assert_eq!(trimmed[0][0].group, vec!["a".to_string()]);
        assert_eq!(trimmed[0][1].group, vec!["b".to_string()]);
    }

    #[test]
    fn splits_composite_group_keys() {
        let mut map = BTreeMap::new();
        map.insert(
            format!("x{}y", GROUP_KEY_DELIMITER),
            Value::Double(2.0),
        );
        let trimmed = AggregationGroupByTrimmingService::new(1).trim_final_results(vec![map]);
        assert_eq!(trimmed[0][0].group, vec!["x".to_string(), "y".to_string()]);
    }
}
