//! Testing utilities for pipelab integrations.
//!
//! This module provides:
//! - Mock components and preparers
//! - Workflow fixtures
//! - An in-memory controller harness

mod fixtures;
mod mocks;

pub use fixtures::{single_step_workflow, train_eval_workflow, TestHarness, EVAL_LOC, TRAIN_LOC};
pub use mocks::{
    FailingComponent, FailingPreparer, RecordedCall, RecordingComponent, SlowComponent,
};
