//! Invocable components and their resolver.
//!
//! The engine never loads user code itself. An integrator registers an
//! [`Invocable`] under each component location, and the lifecycle controller
//! resolves step locations through the [`ComponentRegistry`].

mod registry;

pub use registry::ComponentRegistry;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::fmt::Debug;

use crate::errors::ExecutionError;

/// What a component sees when it is invoked for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    /// The pipeline being run.
    pub pplid: String,
    /// The step name from the workflow template.
    pub step: String,
    /// The location the component was resolved from.
    pub loc: String,
    /// Outputs of the steps that already ran, keyed by step name.
    pub prior_outputs: Map<String, Value>,
}

impl StepContext {
    /// Creates a context with no prior outputs.
    #[must_use]
    pub fn new(pplid: impl Into<String>, step: impl Into<String>, loc: impl Into<String>) -> Self {
        Self {
            pplid: pplid.into(),
            step: step.into(),
            loc: loc.into(),
            prior_outputs: Map::new(),
        }
    }

    /// Returns the output of an earlier step.
    #[must_use]
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.prior_outputs.get(step)
    }
}

/// A unit of behavior the engine can run for a workflow step.
#[async_trait]
pub trait Invocable: Send + Sync + Debug {
    /// Runs the component with the step's resolved arguments.
    ///
    /// Any error is recorded as a step failure; the engine does not retry.
    async fn invoke(&self, ctx: &StepContext, args: &Value) -> Result<Value, ExecutionError>;
}

/// A component backed by a synchronous closure.
pub struct FnComponent<F>
where
    F: Fn(&StepContext, &Value) -> Result<Value, ExecutionError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnComponent<F>
where
    F: Fn(&StepContext, &Value) -> Result<Value, ExecutionError> + Send + Sync,
{
    /// Wraps a closure.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnComponent<F>
where
    F: Fn(&StepContext, &Value) -> Result<Value, ExecutionError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnComponent").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Invocable for FnComponent<F>
where
    F: Fn(&StepContext, &Value) -> Result<Value, ExecutionError> + Send + Sync,
{
    async fn invoke(&self, ctx: &StepContext, args: &Value) -> Result<Value, ExecutionError> {
        (self.func)(ctx, args)
    }
}

/// Boxed future returned by async component closures.
pub type ComponentFuture = BoxFuture<'static, Result<Value, ExecutionError>>;

/// A component backed by an async closure.
///
/// The closure receives owned copies of the context and arguments so the
/// returned future can be `'static`.
pub struct AsyncFnComponent<F>
where
    F: Fn(StepContext, Value) -> ComponentFuture + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> AsyncFnComponent<F>
where
    F: Fn(StepContext, Value) -> ComponentFuture + Send + Sync,
{
    /// Wraps an async closure.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for AsyncFnComponent<F>
where
    F: Fn(StepContext, Value) -> ComponentFuture + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnComponent")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> Invocable for AsyncFnComponent<F>
where
    F: Fn(StepContext, Value) -> ComponentFuture + Send + Sync,
{
    async fn invoke(&self, ctx: &StepContext, args: &Value) -> Result<Value, ExecutionError> {
        (self.func)(ctx.clone(), args.clone()).await
    }
}
