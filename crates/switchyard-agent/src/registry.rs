use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use switchyard_core::config::StepDefinition;
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::traits::StepExecutor;

/// Builds an executor for one step instance from its config.
pub type StepFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn StepExecutor>> + Send + Sync>;

/// Registry mapping step type names to executor factories.
///
/// Resolution happens once, when an agent definition is compiled. Contracts
/// documented in config fill in for executors that declare none.
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
    documented: HashMap<String, StepDefinition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            documented: HashMap::new(),
        }
    }

    /// Record a contract for the step type named `definition.name`.
    pub fn document(&mut self, definition: StepDefinition) {
        self.documented.insert(definition.name.clone(), definition);
    }

    /// The contract of `executor`: its own, unless it declares no inputs or
    /// outputs and one was documented for its type.
    pub fn contract(&self, executor: &dyn StepExecutor) -> StepDefinition {
        let own = executor.definition();
        if !own.inputs.is_empty() || !own.outputs.is_empty() {
            return own;
        }
        match self.documented.get(executor.step_type()) {
            Some(documented) => StepDefinition {
                description: if documented.description.is_empty() {
                    own.description
                } else {
                    documented.description.clone()
                },
                ..documented.clone()
            },
            None => own,
        }
    }

    /// Register a shared executor instance; every step instance reuses it.
    pub fn register(&mut self, step: impl StepExecutor) {
        let name = step.step_type().to_string();
        let step: Arc<dyn StepExecutor> = Arc::new(step);
        self.factories
            .insert(name, Arc::new(move |_config: &Value| Ok(step.clone())));
    }

    /// Register a factory invoked once per step instance with its config.
    pub fn register_factory<F>(&mut self, step_type: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn StepExecutor>> + Send + Sync + 'static,
    {
        self.factories.insert(step_type.into(), Arc::new(factory));
    }

    /// Unregister a step type by name.
    pub fn unregister(&mut self, step_type: &str) -> bool {
        self.factories.remove(step_type).is_some()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// Resolve a step type for the given agent.
    pub fn resolve(
        &self,
        agent: &str,
        step_type: &str,
        config: &Value,
    ) -> Result<Arc<dyn StepExecutor>> {
        let factory = self
            .factories
            .get(step_type)
            .ok_or_else(|| SwitchyardError::UnknownStepType {
                agent: agent.to_string(),
                step_type: step_type.to_string(),
            })?;
        factory(config)
    }

    /// List all registered step types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Contracts of every registered step type that can be built without
    /// config, or that has a documented contract.
    pub fn definitions(&self) -> Vec<StepDefinition> {
        self.list()
            .into_iter()
            .filter_map(|name| match self.resolve("", name, &Value::Null) {
                Ok(step) => Some(self.contract(step.as_ref())),
                Err(_) => self.documented.get(name).cloned(),
            })
            .collect()
    }

    /// Create a registry with all built-in steps registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::DeserializeStep);
        registry.register(crate::builtin::PassthroughStep);
        registry.register_factory("constant", crate::builtin::ConstantStep::from_config);
        registry
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
