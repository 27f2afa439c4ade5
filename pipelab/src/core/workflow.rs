//! Component references and workflow templates.
//!
//! Workflows are value objects: they are never tracked on their own, only
//! the pipelines instantiated from them are.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{EngineError, EngineResult};

/// A reference to an externally resolved component plus its default arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRef {
    /// Location identifier resolved by the component registry.
    pub loc: String,
    /// Default argument mapping.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ComponentRef {
    /// Creates a component reference with no default arguments.
    #[must_use]
    pub fn new(loc: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            args: Map::new(),
        }
    }

    /// Adds a default argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

/// An ordered template of named steps bound to component references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Location identifier of the orchestrating logic.
    pub loc: String,
    /// Step names in execution order.
    pub template: Vec<String>,
    /// Component bound to each step name.
    pub steps: BTreeMap<String, ComponentRef>,
}

impl Workflow {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(loc: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            template: Vec::new(),
            steps: BTreeMap::new(),
        }
    }

    /// Appends a step to the template and binds its component.
    #[must_use]
    pub fn step(mut self, name: impl Into<String>, component: ComponentRef) -> Self {
        let name = name.into();
        self.template.push(name.clone());
        self.steps.insert(name, component);
        self
    }

    /// Returns the component bound to a step.
    #[must_use]
    pub fn component(&self, step: &str) -> Option<&ComponentRef> {
        self.steps.get(step)
    }

    /// Checks the template against the step bindings.
    pub fn validate(&self) -> EngineResult<()> {
        if self.loc.trim().is_empty() {
            return Err(EngineError::configuration("workflow location is empty"));
        }
        if self.template.is_empty() {
            return Err(EngineError::configuration(format!(
                "workflow '{}' has an empty template",
                self.loc
            )));
        }

        let mut seen = HashSet::new();
        for name in &self.template {
            if !seen.insert(name.as_str()) {
                return Err(EngineError::configuration(format!(
                    "workflow '{}' lists step '{name}' twice",
                    self.loc
                )));
            }
            match self.steps.get(name) {
                None => {
                    return Err(EngineError::configuration(format!(
                        "workflow '{}' has no component bound to step '{name}'",
                        self.loc
                    )));
                }
                Some(component) if component.loc.trim().is_empty() => {
                    return Err(EngineError::configuration(format!(
                        "step '{name}' of workflow '{}' has an empty component location",
                        self.loc
                    )));
                }
                Some(_) => {}
            }
        }

        if let Some(unused) = self.steps.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(EngineError::configuration(format!(
                "workflow '{}' binds step '{unused}' that is not in the template",
                self.loc
            )));
        }

        Ok(())
    }

    /// Resolves per-step overrides against the component defaults.
    ///
    /// The result maps every template step to `{"loc": ..., "args": {...}}`
    /// and is what gets stored as a pipeline's argument snapshot.
    pub fn resolve_args(&self, overrides: &Value) -> EngineResult<Value> {
        self.validate()?;

        let overrides = match overrides {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(EngineError::configuration(format!(
                    "argument tree must be an object keyed by step name, got {}",
                    value_kind(other)
                )));
            }
        };

        if let Some(unknown) = overrides.keys().find(|k| !self.steps.contains_key(*k)) {
            return Err(EngineError::configuration(format!(
                "argument tree names unknown step '{unknown}' for workflow '{}'",
                self.loc
            )));
        }

        let mut resolved = Map::new();
        for name in &self.template {
            let Some(component) = self.steps.get(name) else {
                continue;
            };
            let mut args = Value::Object(component.args.clone());
            match overrides.get(name) {
                None | Some(Value::Null) => {}
                Some(patch @ Value::Object(_)) => merge_values(&mut args, patch),
                Some(other) => {
                    return Err(EngineError::configuration(format!(
                        "arguments for step '{name}' must be an object, got {}",
                        value_kind(other)
                    )));
                }
            }
            resolved.insert(
                name.clone(),
                serde_json::json!({ "loc": component.loc, "args": args }),
            );
        }

        Ok(Value::Object(resolved))
    }
}

/// Deep-merges `patch` into `base`; objects merge key by key, everything else replaces.
pub fn merge_values(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
