use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchyard_core::config::{AgentDefinition, OutputBinding, RouteDefinition, RoutePolicy};
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::event::EventBus;
use switchyard_core::state::{ScopedState, WorkflowScope};
use switchyard_core::traits::{ExpressionEvaluator, StepBundle, StepContext, StepExecutor};
use switchyard_core::types::{RuntimeEvent, TopicId, WorkflowState};

use crate::registry::StepRegistry;
use crate::routing::validate_route;

/// Names bound by an instance that a non-empty contract does not declare.
fn undeclared<'a>(
    bound: impl Iterator<Item = &'a String>,
    declared: &'a BTreeMap<String, String>,
) -> impl Iterator<Item = &'a String> {
    bound.filter(move |name| !declared.is_empty() && !declared.contains_key(*name))
}

/// A step instance with its executor already resolved.
pub struct CompiledStep {
    pub name: String,
    pub step_type: String,
    executor: Arc<dyn StepExecutor>,
    /// Logical input name -> state path.
    inputs: Vec<(String, String)>,
    /// Logical output name -> destination.
    outputs: Vec<(String, OutputBinding)>,
    config: Value,
}

impl CompiledStep {
    pub fn executor(&self) -> &Arc<dyn StepExecutor> {
        &self.executor
    }
}

/// Result of running a pipeline to completion.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub state: ScopedState,
    pub steps_run: usize,
}

/// An agent definition compiled against a step registry.
///
/// Built once, then shared read-only between concurrent invocations; every
/// invocation gets its own `ScopedState`.
pub struct AgentHandler {
    topic: String,
    description: String,
    steps: Vec<CompiledStep>,
    routes: Vec<RouteDefinition>,
    route_policy: RoutePolicy,
}

impl AgentHandler {
    /// Resolve every step type and validate every route.
    pub fn compile(
        definition: &AgentDefinition,
        registry: &StepRegistry,
        evaluator: &dyn ExpressionEvaluator,
        default_policy: RoutePolicy,
    ) -> Result<Self> {
        if definition.topic.trim().is_empty() {
            return Err(SwitchyardError::Config("agent topic must not be empty".into()));
        }

        let mut steps = Vec::with_capacity(definition.steps.len());
        for instance in &definition.steps {
            let executor = registry.resolve(&definition.topic, &instance.step_type, &instance.config)?;
            let contract = registry.contract(executor.as_ref());
            for name in undeclared(instance.inputs.keys(), &contract.inputs) {
                warn!(
                    agent = %definition.topic,
                    step = %instance.display_name(),
                    input = %name,
                    "Input is not part of the step's declared contract"
                );
            }
            for name in undeclared(instance.outputs.keys(), &contract.outputs) {
                warn!(
                    agent = %definition.topic,
                    step = %instance.display_name(),
                    output = %name,
                    "Output is not part of the step's declared contract"
                );
            }
            steps.push(CompiledStep {
                name: instance.display_name().to_string(),
                step_type: instance.step_type.clone(),
                executor,
                inputs: instance
                    .inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                outputs: instance
                    .outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                config: instance.config.clone(),
            });
        }

        for (index, route) in definition.routes.iter().enumerate() {
            validate_route(&definition.topic, index, route, evaluator)?;
        }

        Ok(Self {
            topic: definition.topic.clone(),
            description: definition.description.clone(),
            steps,
            routes: definition.routes.clone(),
            route_policy: definition.route_policy.unwrap_or(default_policy),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn steps(&self) -> &[CompiledStep] {
        &self.steps
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.routes
    }

    pub fn route_policy(&self) -> RoutePolicy {
        self.route_policy
    }

    /// Run the step pipeline for one invocation.
    ///
    /// Steps run strictly in order; any failure aborts the rest.
    pub async fn run_pipeline(
        &self,
        incoming: WorkflowState,
        workflow: WorkflowScope,
        topic: &TopicId,
        cancel: &CancellationToken,
        events: &EventBus,
    ) -> Result<PipelineOutcome> {
        let mut state = ScopedState::new(incoming, workflow);

        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SwitchyardError::Cancelled);
            }
            let started = Instant::now();

            let mut inputs = StepBundle::new();
            for (name, path) in &step.inputs {
                let value = state
                    .resolve(path)
                    .await
                    .ok_or_else(|| SwitchyardError::MissingInput {
                        agent: self.topic.clone(),
                        step: step.name.clone(),
                        path: path.clone(),
                    })?;
                inputs.insert(name.clone(), value);
            }

            let ctx = StepContext {
                topic: topic.clone(),
                agent: self.topic.clone(),
                index,
                cancel: cancel.clone(),
            };

            let result = tokio::select! {
                r = step.executor.execute(inputs, &step.config, ctx) => r,
                _ = cancel.cancelled() => return Err(SwitchyardError::Cancelled),
            };
            let mut outputs = result.map_err(|e| SwitchyardError::StepExecution {
                agent: self.topic.clone(),
                step: step.name.clone(),
                message: e.message,
            })?;

            for (name, binding) in &step.outputs {
                let value = outputs
                    .remove(name)
                    .ok_or_else(|| SwitchyardError::MissingOutput {
                        agent: self.topic.clone(),
                        step: step.name.clone(),
                        output: name.clone(),
                    })?;
                state.write(binding.key.clone(), value, binding.scope).await;
            }
            state.advance_step();

            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(
                agent = %self.topic,
                correlation_id = %topic.correlation_id(),
                step = %step.name,
                index,
                elapsed_ms,
                "Step complete"
            );
            events.publish(RuntimeEvent::StepCompleted {
                topic: topic.clone(),
                step: step.name.clone(),
                index,
                elapsed_ms,
            });
        }

        Ok(PipelineOutcome {
            steps_run: self.steps.len(),
            state,
        })
    }
}

impl std::fmt::Debug for AgentHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandler")
            .field("topic", &self.topic)
            .field("steps", &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("routes", &self.routes.len())
            .field("route_policy", &self.route_policy)
            .finish()
    }
}
