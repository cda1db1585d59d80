use std::collections::HashMap;

use basalt_common::{BasaltError, Result};

/// Recognized query-option keys.
pub mod keys {
    /// Per-query deadline override, integer milliseconds.
    pub const TIMEOUT_MS: &str = "timeoutMs";
    /// `sql` selects the ordered, trimmed group-by pipeline.
    pub const GROUP_BY_MODE: &str = "groupByMode";
    /// `sql` selects the tabular response presentation.
    pub const RESPONSE_FORMAT: &str = "responseFormat";
    /// When false, numeric values in legacy responses are formatted as strings.
    pub const PRESERVE_TYPE: &str = "preserveType";
}

const SQL: &str = "sql";

/// Typed view over the raw query-option map. Values compare
/// case-insensitively.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions<'a> {
    options: &'a HashMap<String, String>,
}

impl<'a> QueryOptions<'a> {
    pub fn new(options: &'a HashMap<String, String>) -> Self {
        Self { options }
    }

    /// Per-query timeout override, when present and well-formed.
    pub fn timeout_ms(&self) -> Result<Option<u64>> {
        match self.options.get(keys::TIMEOUT_MS) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| BasaltError::BadQuery(format!("invalid timeoutMs value: {raw}"))),
        }
    }

    /// Whether the SQL group-by pipeline was requested.
    pub fn is_group_by_mode_sql(&self) -> bool {
        self.value_equals(keys::GROUP_BY_MODE, SQL)
    }

    /// Whether the tabular response presentation was requested.
    pub fn is_response_format_sql(&self) -> bool {
        self.value_equals(keys::RESPONSE_FORMAT, SQL)
    }

    /// Whether numeric values keep their types in legacy responses.
    pub fn is_preserve_type(&self) -> bool {
        self.value_equals(keys::PRESERVE_TYPE, "true")
    }

    fn value_equals(&self, key: &str, expected: &str) -> bool {
        self.options
            .get(key)
            .map(|value| value.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}
