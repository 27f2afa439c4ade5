//! # Pipelab
//!
//! A lifecycle, dependency tracking and archival engine for experiment
//! pipelines.
//!
//! Pipelab persists every pipeline it runs and provides:
//!
//! - **Content identity**: a canonical hash of workflow and resolved arguments
//! - **Lifecycle control**: `Created -> Prepared -> Running -> {Completed, Failed}`
//!   with revision-checked transitions
//! - **Dependency tracking**: an acyclic graph of relations between pipelines
//! - **Crash recovery**: heartbeated running entries reclaimed when stale
//! - **Archival and transfer**: atomic moves to an archive store, portable
//!   bundles with integrity checks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipelab::prelude::*;
//!
//! let components = ComponentRegistry::new().with("models.train", TrainComponent::new());
//! let engine = Engine::open(EngineConfig::in_dir("./lab"), components)?;
//!
//! let workflow = Workflow::new("flows.train")
//!     .step("train", ComponentRef::new("models.train").with_arg("lr", json!(0.01)));
//! let outcome = engine.execute(&workflow, &json!({"train": {"lr": 0.1}})).await?;
//! engine.archive_pipeline(&outcome.pplid)?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod archive;
pub mod components;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod identity;
pub mod lifecycle;
pub mod logs;
pub mod observability;
pub mod query;
pub mod registry;
pub mod running;
pub mod store;
pub mod testing;
pub mod utils;

pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{EngineError, EngineResult, ExecutionError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::archive::{ArchiveManager, Bundle, ExportMode, ExportOptions, ImportReport};
    pub use crate::components::{ComponentRegistry, FnComponent, Invocable, StepContext};
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        ComponentRef, Direction, Edge, LogEntry, LogLevel, PipelineRecord, PipelineStatus,
        RelationKind, Workflow,
    };
    pub use crate::engine::Engine;
    pub use crate::errors::{EngineError, EngineResult, ExecutionError};
    pub use crate::graph::DependencyGraph;
    pub use crate::lifecycle::{LifecycleController, NoOpPreparer, Preparer, RunOutcome};
    pub use crate::query::{group_by_common_columns, Column};
    pub use crate::registry::{PipelineFilter, PipelineRegistry};
    pub use crate::store::Store;
    pub use crate::utils::{now_utc, Timestamp};
}
