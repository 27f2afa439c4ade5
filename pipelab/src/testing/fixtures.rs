//! Workflow fixtures and an in-memory harness.

use serde_json::json;
use std::sync::Arc;

use crate::components::ComponentRegistry;
use crate::core::{ComponentRef, Workflow};
use crate::errors::EngineResult;
use crate::graph::DependencyGraph;
use crate::lifecycle::LifecycleController;
use crate::store::Store;

/// Location of the training component in [`train_eval_workflow`].
pub const TRAIN_LOC: &str = "models.train";

/// Location of the evaluation component in [`train_eval_workflow`].
pub const EVAL_LOC: &str = "metrics.evaluate";

/// A two-step `train -> eval` workflow with default arguments.
#[must_use]
pub fn train_eval_workflow() -> Workflow {
    Workflow::new("flows.train_eval")
        .step(
            "train",
            ComponentRef::new(TRAIN_LOC)
                .with_arg("lr", json!(0.01))
                .with_arg("epochs", json!(10)),
        )
        .step(
            "eval",
            ComponentRef::new(EVAL_LOC).with_arg("metric", json!("accuracy")),
        )
}

/// A workflow with one step bound to `loc`.
#[must_use]
pub fn single_step_workflow(loc: &str) -> Workflow {
    Workflow::new("flows.single").step("only", ComponentRef::new(loc))
}

/// An in-memory store with a controller and graph over it.
#[derive(Debug)]
pub struct TestHarness {
    /// The shared store.
    pub store: Arc<Store>,
    /// The component resolver the controller uses.
    pub components: Arc<ComponentRegistry>,
    /// The controller under test.
    pub controller: LifecycleController,
    /// Graph over the same store.
    pub graph: DependencyGraph,
}

impl TestHarness {
    /// Creates a harness with an empty component registry.
    pub fn new() -> EngineResult<Self> {
        Self::with_components(ComponentRegistry::new())
    }

    /// Creates a harness resolving through `components`.
    pub fn with_components(components: ComponentRegistry) -> EngineResult<Self> {
        let store = Arc::new(Store::open_in_memory()?);
        let components = Arc::new(components);
        Ok(Self {
            controller: LifecycleController::new(Arc::clone(&store), Arc::clone(&components)),
            graph: DependencyGraph::new(Arc::clone(&store)),
            components,
            store,
        })
    }

    /// Replaces the controller, e.g. to install a preparer.
    #[must_use]
    pub fn map_controller(
        mut self,
        f: impl FnOnce(LifecycleController) -> LifecycleController,
    ) -> Self {
        self.controller = f(self.controller);
        self
    }
}
