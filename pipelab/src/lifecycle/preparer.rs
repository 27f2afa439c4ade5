//! Resource preparation seam.

use async_trait::async_trait;

use crate::core::PipelineRecord;

/// Sets up whatever a pipeline needs before it can run (directories,
/// scratch space, staged inputs).
///
/// An `Err` keeps the pipeline in `Created` and is reported as a
/// `PreparationError` carrying the message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Preparer: Send + Sync {
    /// Prepares resources for one pipeline.
    async fn prepare(&self, record: &PipelineRecord) -> Result<(), String>;
}

/// A preparer that has nothing to set up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPreparer;

#[async_trait]
impl Preparer for NoOpPreparer {
    async fn prepare(&self, _record: &PipelineRecord) -> Result<(), String> {
        Ok(())
    }
}
