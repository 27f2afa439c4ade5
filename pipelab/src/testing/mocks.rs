//! Mock components and preparers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::components::{Invocable, StepContext};
use crate::core::PipelineRecord;
use crate::errors::ExecutionError;
use crate::lifecycle::Preparer;

/// One recorded component invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// The context the component received.
    pub ctx: StepContext,
    /// The arguments the component received.
    pub args: Value,
}

/// A component that records its calls and returns a fixed output.
#[derive(Debug, Default)]
pub struct RecordingComponent {
    output: Mutex<Value>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingComponent {
    /// Creates a recording component that returns `null`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recording component that returns `output`.
    #[must_use]
    pub fn returning(output: Value) -> Self {
        Self {
            output: Mutex::new(output),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Creates a shared instance, so a test can keep a handle after
    /// registering it.
    #[must_use]
    pub fn shared(output: Value) -> Arc<Self> {
        Arc::new(Self::returning(output))
    }

    /// Sets the output to return.
    pub fn set_output(&self, output: Value) {
        *self.output.lock() = output;
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns every recorded invocation.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns the step names it was invoked for, in order.
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.ctx.step.clone()).collect()
    }

    /// Clears recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Invocable for RecordingComponent {
    async fn invoke(&self, ctx: &StepContext, args: &Value) -> Result<Value, ExecutionError> {
        self.calls.lock().push(RecordedCall {
            ctx: ctx.clone(),
            args: args.clone(),
        });
        Ok(self.output.lock().clone())
    }
}

/// A component that always fails.
#[derive(Debug, Clone)]
pub struct FailingComponent {
    message: String,
}

impl FailingComponent {
    /// Creates a component failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Invocable for FailingComponent {
    async fn invoke(&self, _ctx: &StepContext, _args: &Value) -> Result<Value, ExecutionError> {
        Err(ExecutionError::new(&self.message))
    }
}

/// A component that sleeps before succeeding.
#[derive(Debug, Clone)]
pub struct SlowComponent {
    delay: Duration,
    output: Value,
}

impl SlowComponent {
    /// Creates a slow component returning `null`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            output: Value::Null,
        }
    }

    /// Creates a slow component with a delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Invocable for SlowComponent {
    async fn invoke(&self, _ctx: &StepContext, _args: &Value) -> Result<Value, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.output.clone())
    }
}

/// A preparer that always fails.
#[derive(Debug, Clone)]
pub struct FailingPreparer {
    message: String,
}

impl FailingPreparer {
    /// Creates a preparer failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Preparer for FailingPreparer {
    async fn prepare(&self, _record: &PipelineRecord) -> Result<(), String> {
        Err(self.message.clone())
    }
}
