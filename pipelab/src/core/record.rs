//! Persisted entities: pipeline records, edges, running entries and log entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{PipelineStatus, Workflow};
use crate::utils::Timestamp;

/// A tracked instantiation of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Unique, immutable identifier.
    pub pplid: String,
    /// Hash of the workflow location and resolved arguments.
    pub content_hash: String,
    /// The workflow this pipeline instantiates.
    pub workflow: Workflow,
    /// Resolved per-step arguments (`{step: {"loc", "args"}}`).
    pub args_snapshot: Value,
    /// Current lifecycle status.
    pub status: PipelineStatus,
    /// Incremented on every status change.
    pub revision: i64,
    /// When the record was created.
    pub created_at: Timestamp,
    /// When the record last changed.
    pub updated_at: Timestamp,
    /// When the pipeline completed, if it has.
    pub completed_at: Option<Timestamp>,
}

impl PipelineRecord {
    /// Returns the resolved arguments for one step.
    #[must_use]
    pub fn step_args(&self, step: &str) -> Option<&Value> {
        self.args_snapshot.get(step).and_then(|s| s.get("args"))
    }

    /// Returns the component location recorded for one step.
    #[must_use]
    pub fn step_loc(&self, step: &str) -> Option<&str> {
        self.args_snapshot
            .get(step)
            .and_then(|s| s.get("loc"))
            .and_then(Value::as_str)
    }

    /// Looks up a dotted path inside the argument snapshot.
    ///
    /// `"train.args.lr"` reads `args_snapshot["train"]["args"]["lr"]`; array
    /// elements are addressed by index.
    #[must_use]
    pub fn arg(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.args_snapshot, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// The kind of relation an edge records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
    /// The child consumes the parent's results.
    DependsOn,
    /// The child was derived from the parent's configuration.
    DerivedFrom,
    /// Any other caller-defined relation.
    Other(String),
}

impl RelationKind {
    /// Returns the persisted text form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::DependsOn => "depends-on",
            Self::DerivedFrom => "derived-from",
            Self::Other(kind) => kind,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RelationKind {
    fn from(s: &str) -> Self {
        match s {
            "depends-on" => Self::DependsOn,
            "derived-from" => Self::DerivedFrom,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Serialize for RelationKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RelationKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// A directed relation between two pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The upstream pipeline.
    pub parent: String,
    /// The downstream pipeline.
    pub child: String,
    /// What the relation means.
    pub kind: RelationKind,
    /// When the edge was recorded.
    pub created_at: Timestamp,
}

/// Which side of a node to read edges from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges where the node is the child.
    Incoming,
    /// Edges where the node is the parent.
    Outgoing,
}

/// Marker row for a pipeline that is currently executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningEntry {
    /// The running pipeline.
    pub pplid: String,
    /// `<host>:<pid>` of the process driving the run.
    pub marker: String,
    /// When the run started.
    pub started_at: Timestamp,
    /// Last liveness refresh.
    pub heartbeat_at: Timestamp,
}

/// Severity of a pipeline log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress.
    Info,
    /// Something unexpected that did not fail the run.
    Warn,
    /// A failure.
    Error,
}

impl LogLevel {
    /// Returns the persisted text form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// An append-only log line attached to a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-local sequence number.
    pub seq: i64,
    /// The pipeline the entry belongs to.
    pub pplid: String,
    /// When the entry was written.
    pub timestamp: Timestamp,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}
