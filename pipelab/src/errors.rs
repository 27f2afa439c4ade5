//! Error types for the pipelab engine.
//!
//! Every engine operation returns [`EngineError`]. Structural errors
//! (configuration, cycles, illegal transitions) are raised before any store
//! mutation; step failures are recorded against the pipeline instead of
//! escaping the lifecycle controller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::PipelineStatus;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow or argument tree cannot be hashed or bound.
    #[error("Configuration error{}: {message}", pplid_suffix(.pplid))]
    Configuration {
        /// The pipeline involved, if one exists yet.
        pplid: Option<String>,
        /// What is wrong with the configuration.
        message: String,
    },

    /// No pipeline (or running entry) exists under the identifier.
    #[error("Pipeline not found: {pplid}{}", detail_suffix(.detail))]
    NotFound {
        /// The unknown identifier.
        pplid: String,
        /// Which table the lookup went to, when it is not the registry.
        detail: Option<String>,
    },

    /// The requested status change is not allowed by the state machine.
    #[error("Invalid transition for {pplid}: {from} -> {to}{}", detail_suffix(.reason))]
    InvalidTransition {
        /// The pipeline identifier.
        pplid: String,
        /// The status the record is in.
        from: PipelineStatus,
        /// The status that was requested.
        to: PipelineStatus,
        /// Optional extra explanation.
        reason: Option<String>,
    },

    /// Another writer changed the record since it was read.
    #[error("Concurrent modification of {pplid}: expected revision {expected}, found {actual}")]
    ConcurrentModification {
        /// The pipeline identifier.
        pplid: String,
        /// The revision the caller observed.
        expected: i64,
        /// The revision currently stored.
        actual: i64,
    },

    /// The edge would introduce a cycle into the dependency graph.
    #[error("Cycle detected adding {parent} -> {child}: {}", .path.join(" -> "))]
    Cycle {
        /// The parent endpoint of the rejected edge.
        parent: String,
        /// The child endpoint of the rejected edge.
        child: String,
        /// The closed path the edge would create.
        path: Vec<String>,
    },

    /// The pipeline already has an active run.
    #[error("Pipeline {pplid} is already running (held by {marker})")]
    AlreadyRunning {
        /// The pipeline identifier.
        pplid: String,
        /// Host/process marker of the current holder.
        marker: String,
    },

    /// Resource preparation for the pipeline failed.
    #[error("Preparation failed for {pplid}: {message}")]
    Preparation {
        /// The pipeline identifier.
        pplid: String,
        /// The collaborator's failure message.
        message: String,
    },

    /// A workflow step failed.
    #[error("Step '{step}' of {pplid} failed: {source}")]
    Execution {
        /// The pipeline identifier.
        pplid: String,
        /// The failing step name.
        step: String,
        /// The component's error.
        #[source]
        source: ExecutionError,
    },

    /// An imported or reloaded record does not match its content hash.
    #[error("Integrity check failed for {pplid}: expected {expected}, computed {actual}")]
    Integrity {
        /// The pipeline whose stored hash does not match.
        pplid: String,
        /// The hash carried by the record.
        expected: String,
        /// The hash recomputed from the record's content.
        actual: String,
    },

    /// Persisted data could not be decoded.
    #[error("Corrupt store data: {0}")]
    Corrupt(String),

    /// Underlying store failure.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::utils::TimestampError> for EngineError {
    fn from(err: crate::utils::TimestampError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

fn pplid_suffix(pplid: &Option<String>) -> String {
    pplid.as_deref().map(|id| format!(" for {id}")).unwrap_or_default()
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
}

impl EngineError {
    /// Creates a configuration error not tied to a pipeline.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            pplid: None,
            message: message.into(),
        }
    }

    /// Creates a configuration error for a known pipeline.
    #[must_use]
    pub fn configuration_for(pplid: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            pplid: Some(pplid.into()),
            message: message.into(),
        }
    }

    /// Creates a not found error for the pipeline registry.
    #[must_use]
    pub fn not_found(pplid: impl Into<String>) -> Self {
        Self::NotFound {
            pplid: pplid.into(),
            detail: None,
        }
    }

    /// Creates a not found error naming the table that was searched.
    #[must_use]
    pub fn not_found_in(pplid: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NotFound {
            pplid: pplid.into(),
            detail: Some(detail.into()),
        }
    }

    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(
        pplid: impl Into<String>,
        from: PipelineStatus,
        to: PipelineStatus,
    ) -> Self {
        Self::InvalidTransition {
            pplid: pplid.into(),
            from,
            to,
            reason: None,
        }
    }

    /// Creates an invalid transition error with an explanation.
    #[must_use]
    pub fn invalid_transition_because(
        pplid: impl Into<String>,
        from: PipelineStatus,
        to: PipelineStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            pplid: pplid.into(),
            from,
            to,
            reason: Some(reason.into()),
        }
    }

    /// Creates an error for undecodable persisted data.
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    /// Returns the pipeline identifier this error concerns, if any.
    #[must_use]
    pub fn pplid(&self) -> Option<&str> {
        match self {
            Self::Configuration { pplid, .. } => pplid.as_deref(),
            Self::NotFound { pplid, .. }
            | Self::InvalidTransition { pplid, .. }
            | Self::ConcurrentModification { pplid, .. }
            | Self::AlreadyRunning { pplid, .. }
            | Self::Preparation { pplid, .. }
            | Self::Execution { pplid, .. }
            | Self::Integrity { pplid, .. } => Some(pplid),
            Self::Cycle { child, .. } => Some(child),
            Self::Corrupt(_) | Self::Store(_) | Self::Serialization(_) | Self::Io(_) => None,
        }
    }

    /// Returns a stable machine-readable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "ConfigurationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::InvalidTransition { .. } => "InvalidTransitionError",
            Self::ConcurrentModification { .. } => "ConcurrentModificationError",
            Self::Cycle { .. } => "CycleError",
            Self::AlreadyRunning { .. } => "AlreadyRunningError",
            Self::Preparation { .. } => "PreparationError",
            Self::Execution { .. } => "ExecutionError",
            Self::Integrity { .. } => "IntegrityError",
            Self::Corrupt(_) => "CorruptDataError",
            Self::Store(_) => "StoreError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }

    /// Returns true for errors raised before any state was touched.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::Cycle { .. } | Self::InvalidTransition { .. }
        )
    }

    /// Converts to a dictionary representation for operator tooling.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        if let Some(pplid) = self.pplid() {
            map.insert("pplid".to_string(), serde_json::json!(pplid));
        }
        match self {
            Self::InvalidTransition { from, to, .. } => {
                map.insert("from".to_string(), serde_json::json!(from));
                map.insert("to".to_string(), serde_json::json!(to));
            }
            Self::Cycle { path, .. } => {
                map.insert("path".to_string(), serde_json::json!(path));
            }
            Self::Execution { step, .. } => {
                map.insert("step".to_string(), serde_json::json!(step));
            }
            _ => {}
        }
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Error raised by a component while executing a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionError {
    /// Human-readable cause.
    pub message: String,
    /// The component location that failed, if known.
    pub loc: Option<String>,
}

impl ExecutionError {
    /// Creates a new execution error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            loc: None,
        }
    }

    /// Records which component location raised the error.
    #[must_use]
    pub fn with_loc(mut self, loc: impl Into<String>) -> Self {
        self.loc = Some(loc.into());
        self
    }

    /// Creates an error for a location with no registered component.
    #[must_use]
    pub fn unresolved(loc: impl Into<String>) -> Self {
        let loc = loc.into();
        Self {
            message: format!("No component registered for location '{loc}'"),
            loc: Some(loc),
        }
    }
}

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;
