//! Location-keyed component registry.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::Invocable;
use crate::errors::ExecutionError;

/// Maps component locations to invocable capabilities.
///
/// Populated by the integrator at startup; safe to share across tasks.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    components: DashMap<String, Arc<dyn Invocable>>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component under a location, replacing any previous one.
    pub fn register(&self, loc: impl Into<String>, component: impl Invocable + 'static) {
        self.register_arc(loc, Arc::new(component));
    }

    /// Registers a shared component under a location.
    pub fn register_arc(&self, loc: impl Into<String>, component: Arc<dyn Invocable>) {
        let loc = loc.into();
        debug!(loc = %loc, "Registered component");
        self.components.insert(loc, component);
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with(self, loc: impl Into<String>, component: impl Invocable + 'static) -> Self {
        self.register(loc, component);
        self
    }

    /// Removes the component at a location.
    pub fn unregister(&self, loc: &str) -> Option<Arc<dyn Invocable>> {
        self.components.remove(loc).map(|(_, c)| c)
    }

    /// Resolves a location to its component.
    pub fn resolve(&self, loc: &str) -> Result<Arc<dyn Invocable>, ExecutionError> {
        self.components
            .get(loc)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ExecutionError::unresolved(loc))
    }

    /// Returns true if a component is registered at the location.
    #[must_use]
    pub fn contains(&self, loc: &str) -> bool {
        self.components.contains_key(loc)
    }

    /// Returns every registered location, sorted.
    #[must_use]
    pub fn locations(&self) -> Vec<String> {
        let mut locs: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        locs.sort();
        locs
    }

    /// Returns the number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{FnComponent, StepContext};
    use serde_json::{json, Value};

    fn echo() -> FnComponent<impl Fn(&StepContext, &Value) -> Result<Value, ExecutionError> + Send + Sync> {
        FnComponent::new("echo", |_ctx: &StepContext, args: &Value| Ok(args.clone()))
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = ComponentRegistry::new().with("util.echo", echo());
        assert!(registry.contains("util.echo"));

        let component = registry.resolve("util.echo").unwrap();
        let ctx = StepContext::new("ppl-1", "echo", "util.echo");
        assert_eq!(component.invoke(&ctx, &json!({"a": 1})).await, Ok(json!({"a": 1})));
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = ComponentRegistry::new();
        let err = registry.resolve("util.missing").unwrap_err();
        assert_eq!(err.loc.as_deref(), Some("util.missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_locations_sorted_and_unregister() {
        let registry = ComponentRegistry::new();
        registry.register("b.two", echo());
        registry.register("a.one", echo());
        assert_eq!(registry.locations(), vec!["a.one", "b.two"]);

        assert!(registry.unregister("a.one").is_some());
        assert_eq!(registry.len(), 1);
    }
}
