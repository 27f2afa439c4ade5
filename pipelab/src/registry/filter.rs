//! Record filters for registry listings.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::core::{PipelineRecord, PipelineStatus};
use crate::identity::canonical_json;
use crate::utils::{to_millis, Timestamp};

/// Criteria for [`super::PipelineRegistry::list`].
///
/// Column criteria are pushed into SQL; argument-path criteria are applied
/// to decoded records.
#[derive(Debug, Clone, Default)]
pub struct PipelineFilter {
    /// Accepted statuses; empty means any.
    pub statuses: Vec<PipelineStatus>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<Timestamp>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<Timestamp>,
    /// Exact workflow location.
    pub workflow_loc: Option<String>,
    /// Exact content hash.
    pub content_hash: Option<String>,
    /// Dotted argument paths that must equal the given values.
    pub arg_equals: Vec<(String, Value)>,
    /// Maximum number of records returned.
    pub limit: Option<usize>,
}

impl PipelineFilter {
    /// Creates a filter that matches every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts records in the given status (may be called repeatedly).
    #[must_use]
    pub fn with_status(mut self, status: PipelineStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    /// Restricts to records created in `[after, before)`.
    #[must_use]
    pub fn with_created_range(mut self, after: Option<Timestamp>, before: Option<Timestamp>) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    /// Restricts to one workflow location.
    #[must_use]
    pub fn with_workflow(mut self, loc: impl Into<String>) -> Self {
        self.workflow_loc = Some(loc.into());
        self
    }

    /// Restricts to one content hash.
    #[must_use]
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Requires the argument at `path` to equal `value`.
    ///
    /// Values are compared in canonical form, so `1` matches `1.0`.
    #[must_use]
    pub fn with_arg(mut self, path: impl Into<String>, value: Value) -> Self {
        self.arg_equals.push((path.into(), value));
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the record satisfies every criterion.
    #[must_use]
    pub fn matches(&self, record: &PipelineRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if self.created_after.is_some_and(|t| record.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| record.created_at >= t) {
            return false;
        }
        if self
            .workflow_loc
            .as_deref()
            .is_some_and(|loc| record.workflow.loc != loc)
        {
            return false;
        }
        if self
            .content_hash
            .as_deref()
            .is_some_and(|hash| record.content_hash != hash)
        {
            return false;
        }
        self.matches_args(record)
    }

    pub(crate) fn matches_args(&self, record: &PipelineRecord) -> bool {
        self.arg_equals.iter().all(|(path, expected)| {
            record
                .arg(path)
                .is_some_and(|actual| same_value(actual, expected))
        })
    }

    /// Builds the `WHERE` clause and its positional parameters.
    pub(crate) fn sql_clause(&self) -> (String, Vec<SqlValue>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if !self.statuses.is_empty() {
            let mut slots = Vec::with_capacity(self.statuses.len());
            for status in &self.statuses {
                values.push(SqlValue::Text(status.as_str().to_string()));
                slots.push(format!("?{}", values.len()));
            }
            conditions.push(format!("status IN ({})", slots.join(", ")));
        }
        if let Some(after) = &self.created_after {
            values.push(SqlValue::Integer(to_millis(after)));
            conditions.push(format!("created_at_ms >= ?{}", values.len()));
        }
        if let Some(before) = &self.created_before {
            values.push(SqlValue::Integer(to_millis(before)));
            conditions.push(format!("created_at_ms < ?{}", values.len()));
        }
        if let Some(loc) = &self.workflow_loc {
            values.push(SqlValue::Text(loc.clone()));
            conditions.push(format!("workflow_loc = ?{}", values.len()));
        }
        if let Some(hash) = &self.content_hash {
            values.push(SqlValue::Text(hash.clone()));
            conditions.push(format!("content_hash = ?{}", values.len()));
        }

        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), values)
        }
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (canonical_json(a), canonical_json(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
