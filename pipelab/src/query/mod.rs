//! Read-only filtering and grouping over record snapshots.
//!
//! These functions never touch the store. Take a snapshot with
//! [`PipelineRegistry::snapshot`](crate::registry::PipelineRegistry::snapshot)
//! and query it in memory.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::PipelineRecord;
use crate::errors::EngineResult;
use crate::identity::canonical_json;

/// A record attribute records can be grouped on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Column {
    /// Lifecycle status.
    Status,
    /// Workflow location.
    Workflow,
    /// Content hash.
    ContentHash,
    /// A dotted path into the argument snapshot, e.g. `train.args.lr`.
    Arg(String),
}

impl Column {
    /// Shorthand for [`Column::Arg`].
    #[must_use]
    pub fn arg(path: impl Into<String>) -> Self {
        Self::Arg(path.into())
    }

    /// Returns the canonical value of this column for a record.
    ///
    /// `None` means the argument path does not exist in the record.
    pub fn key(&self, record: &PipelineRecord) -> EngineResult<Option<String>> {
        Ok(match self {
            Self::Status => Some(record.status.as_str().to_string()),
            Self::Workflow => Some(record.workflow.loc.clone()),
            Self::ContentHash => Some(record.content_hash.clone()),
            Self::Arg(path) => record.arg(path).map(canonical_json).transpose()?,
        })
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => f.write_str("status"),
            Self::Workflow => f.write_str("workflow"),
            Self::ContentHash => f.write_str("content_hash"),
            Self::Arg(path) => write!(f, "args.{path}"),
        }
    }
}

/// Records sharing the same values on a set of columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Group<'a> {
    /// Canonical value per grouping column, in column order.
    pub key: Vec<Option<String>>,
    /// Members in input order.
    pub members: Vec<&'a PipelineRecord>,
}

impl Group<'_> {
    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member identifiers in input order.
    #[must_use]
    pub fn pplids(&self) -> Vec<&str> {
        self.members.iter().map(|r| r.pplid.as_str()).collect()
    }
}

/// Keeps the records matching `predicate`.
pub fn filter<'a>(
    records: &'a [PipelineRecord],
    predicate: impl Fn(&PipelineRecord) -> bool,
) -> Vec<&'a PipelineRecord> {
    records.iter().filter(|r| predicate(r)).collect()
}

/// Partitions records by their values on `columns`.
///
/// Groups are ordered by key; a missing argument sorts before any value.
pub fn group_by_common_columns<'a>(
    records: &'a [PipelineRecord],
    columns: &[Column],
) -> EngineResult<Vec<Group<'a>>> {
    let mut groups: BTreeMap<Vec<Option<String>>, Vec<&'a PipelineRecord>> = BTreeMap::new();
    for record in records {
        let key = columns
            .iter()
            .map(|column| column.key(record))
            .collect::<EngineResult<Vec<_>>>()?;
        groups.entry(key).or_default().push(record);
    }
    Ok(groups
        .into_iter()
        .map(|(key, members)| Group { key, members })
        .collect())
}

/// Groups of records sharing a content hash, with more than one member.
pub fn duplicate_groups(records: &[PipelineRecord]) -> EngineResult<Vec<Group<'_>>> {
    let mut groups = group_by_common_columns(records, &[Column::ContentHash])?;
    groups.retain(|g| g.len() > 1);
    Ok(groups)
}

/// Returns the candidate columns whose value is not the same across `records`.
pub fn varying_columns(
    records: &[PipelineRecord],
    candidates: &[Column],
) -> EngineResult<Vec<Column>> {
    let mut varying = Vec::new();
    for column in candidates {
        let mut values = BTreeSet::new();
        for record in records {
            values.insert(column.key(record)?);
            if values.len() > 1 {
                break;
            }
        }
        if values.len() > 1 {
            varying.push(column.clone());
        }
    }
    Ok(varying)
}
