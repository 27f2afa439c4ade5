//! Core domain model types for pipelab.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Pipeline status and its state machine
//! - Workflow templates and component references
//! - Persisted records (pipelines, edges, running entries, log entries)

mod record;
mod status;
mod workflow;

pub use record::{
    Direction, Edge, LogEntry, LogLevel, PipelineRecord, RelationKind, RunningEntry,
};
pub use status::PipelineStatus;
pub use workflow::{merge_values, ComponentRef, Workflow};
