use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use switchyard_core::config::{AgentDefinition, RuntimeSettings, StepDefinition, SwitchyardConfig};
use switchyard_core::error::Result;
use switchyard_core::event::EventBus;
use switchyard_core::traits::{ExpressionEvaluator, StepExecutor};
use switchyard_core::types::{CorrelationId, RuntimeEvent, TopicId, WorkflowState};

use crate::bus::{Delivery, HandlerTable, MessageBus};
use crate::completion::CompletionHandle;
use crate::expr::PathEvaluator;
use crate::handler::AgentHandler;
use crate::registry::StepRegistry;

/// Assembles a `Runtime` from agent definitions, a step registry and an
/// expression evaluator.
pub struct RuntimeBuilder {
    settings: RuntimeSettings,
    agents: Vec<AgentDefinition>,
    registry: StepRegistry,
    documented: Vec<StepDefinition>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    event_bus: Option<Arc<EventBus>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            settings: RuntimeSettings::default(),
            agents: Vec::new(),
            registry: StepRegistry::with_builtins(),
            documented: Vec::new(),
            evaluator: Arc::new(PathEvaluator),
            event_bus: None,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take runtime settings, documented step contracts and agents from a
    /// loaded config.
    pub fn with_config(mut self, config: &SwitchyardConfig) -> Self {
        self.settings = config.runtime.clone();
        self.documented.extend(config.steps.iter().cloned());
        self.agents.extend(config.agents.iter().cloned());
        self
    }

    /// Contract used for a step type whose executor declares none.
    pub fn document(mut self, definition: StepDefinition) -> Self {
        self.documented.push(definition);
        self
    }

    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn agent(mut self, definition: AgentDefinition) -> Self {
        self.agents.push(definition);
        self
    }

    /// Replace the step registry (built-ins are registered by default).
    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add one step type to the current registry.
    pub fn step(mut self, step: impl StepExecutor) -> Self {
        self.registry.register(step);
        self
    }

    pub fn evaluator(mut self, evaluator: impl ExpressionEvaluator) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Compile every agent and bind it to its topic.
    ///
    /// Fails on the first build error; nothing is dispatched until this
    /// succeeds.
    pub fn build(mut self) -> Result<Runtime> {
        for definition in self.documented.drain(..) {
            if !self.registry.contains(&definition.name) {
                warn!(step = %definition.name, "Documented step type is not registered");
            }
            self.registry.document(definition);
        }

        let mut table = HandlerTable::new();
        for definition in &self.agents {
            let handler = AgentHandler::compile(
                definition,
                &self.registry,
                self.evaluator.as_ref(),
                self.settings.route_policy,
            )?;
            if handler.topic() == self.settings.completion_topic {
                warn!(
                    agent = %handler.topic(),
                    "Agent subscribes to the completion topic; registered completions take precedence"
                );
            }
            table.subscribe(handler)?;
        }

        let known: HashSet<&str> = table.topics().into_iter().collect();
        for definition in &self.agents {
            for (index, route) in definition.routes.iter().enumerate() {
                for receiver in &route.receivers {
                    if receiver != &self.settings.completion_topic && !known.contains(receiver.as_str())
                    {
                        warn!(
                            agent = %definition.topic,
                            route = index,
                            receiver = %receiver,
                            "Route receiver has no subscribed agent"
                        );
                    }
                }
            }
        }

        let events = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.settings.event_capacity)));
        info!(agents = table.len(), steps = self.registry.list().len(), "Runtime built");

        let steps = self.registry.definitions();
        let bus = MessageBus::new(table, self.evaluator, &self.settings, events);
        Ok(Runtime {
            bus: Arc::new(bus),
            settings: self.settings,
            steps,
        })
    }
}

/// The host-facing surface: publish, await completion, pause and resume.
pub struct Runtime {
    bus: Arc<MessageBus>,
    settings: RuntimeSettings,
    steps: Vec<StepDefinition>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Build a runtime from config using the built-in steps.
    pub fn from_config(config: &SwitchyardConfig) -> Result<Self> {
        RuntimeBuilder::new().with_config(config).build()
    }

    /// Start or continue a workflow. Must be called within a tokio runtime.
    pub fn publish(
        &self,
        state: WorkflowState,
        topic: TopicId,
        cancel: CancellationToken,
    ) -> Result<Delivery> {
        self.bus.publish(state, topic, cancel)
    }

    /// The pending completion for `topic`, registered on first access.
    pub fn completion(&self, topic: &TopicId) -> CompletionHandle {
        self.bus.completion(topic)
    }

    /// The reserved completion identity for a correlation id.
    pub fn completion_topic(&self, correlation_id: &CorrelationId) -> TopicId {
        TopicId::new(self.settings.completion_topic.clone(), correlation_id.clone())
    }

    pub fn pause(&self, topic: &TopicId) -> bool {
        self.bus.pause(topic)
    }

    /// Unpause `topic` and dispatch what was held for it.
    pub fn resume(&self, topic: &TopicId) -> Vec<Result<Delivery>> {
        self.bus.resume(topic)
    }

    pub fn is_paused(&self, topic: &TopicId) -> bool {
        self.bus.is_paused(topic)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.bus.events().subscribe()
    }

    /// Subscribed topic names, sorted.
    pub fn topics(&self) -> Vec<&str> {
        self.bus.handlers().topics()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Contracts of the step types this runtime was built with.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.completion_timeout_secs)
    }

    /// Publish `state` to `entry_topic` and wait for the workflow's completion.
    ///
    /// The completion is registered before publishing. A failure of the entry
    /// invocation itself is returned as soon as it happens.
    pub async fn run(
        &self,
        entry_topic: &str,
        state: WorkflowState,
        timeout: Option<Duration>,
    ) -> Result<WorkflowState> {
        self.run_with_cancel(entry_topic, state, timeout, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        entry_topic: &str,
        state: WorkflowState,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<WorkflowState> {
        let correlation_id = state.correlation_id.clone();
        let done = self.completion(&self.completion_topic(&correlation_id));
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        info!(
            entry = %entry_topic,
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis() as u64,
            "Running workflow"
        );

        let entry = TopicId::new(entry_topic, correlation_id.clone());
        let delivery = match self.bus.publish(state, entry, cancel.clone()) {
            Ok(delivery) => delivery,
            Err(e) => {
                done.abandon();
                self.bus.abandon_workflow(&correlation_id);
                return Err(e);
            }
        };

        let result = match delivery.into_invocation() {
            Some(invocation) => {
                let waiter = done.clone().wait_or_cancel(timeout, &cancel);
                tokio::pin!(waiter);
                let joined = invocation.join();
                tokio::pin!(joined);
                tokio::select! {
                    r = &mut waiter => r,
                    j = &mut joined => match j {
                        Ok(_) => waiter.await,
                        Err(e) => {
                            done.abandon();
                            Err(e)
                        }
                    },
                }
            }
            None => done.wait_or_cancel(timeout, &cancel).await,
        };

        if result.is_err() {
            self.bus.abandon_workflow(&correlation_id);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::config::RouteDefinition;
    use switchyard_core::error::SwitchyardError;
    use switchyard_test_utils::{eventually, FnStep};

    fn forward(topic: &str, next: &str) -> AgentDefinition {
        AgentDefinition::new(topic).route(RouteDefinition::always().to(next))
    }

    #[test]
    fn duplicate_topic_fails_build() {
        let err = Runtime::builder()
            .agent(forward("a", "workflow-completion"))
            .agent(forward("a", "workflow-completion"))
            .build()
            .err()
            .expect("duplicate should fail");
        assert!(err.is_build_error());
    }

    #[test]
    fn config_step_contracts_reach_the_registry() {
        let config = SwitchyardConfig::from_toml_str(
            r#"
[[steps]]
name = "fake-model"
description = "Model stand-in"
inputs = { prompt = "string" }
outputs = { text = "string" }
"#,
        )
        .unwrap();
        let runtime = Runtime::builder()
            .with_config(&config)
            .step(FnStep::new("fake-model", |inputs, _| Ok(inputs)))
            .build()
            .unwrap();
        let fake = runtime.steps().iter().find(|d| d.name == "fake-model").unwrap();
        assert_eq!(fake.description, "Model stand-in");
        assert_eq!(fake.inputs.get("prompt").map(String::as_str), Some("string"));
        // built-ins keep their own contract
        let passthrough = runtime.steps().iter().find(|d| d.name == "passthrough").unwrap();
        assert!(passthrough.inputs.contains_key("value"));
    }

    #[test]
    fn topics_are_sorted() {
        let runtime = Runtime::builder()
            .agent(forward("zeta", "alpha"))
            .agent(forward("alpha", "workflow-completion"))
            .build()
            .unwrap();
        assert_eq!(runtime.topics(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn completion_topic_uses_settings() {
        let mut settings = RuntimeSettings::default();
        settings.completion_topic = "done".into();
        let runtime = Runtime::builder().settings(settings).build().unwrap();
        let topic = runtime.completion_topic(&CorrelationId::from("wf-9"));
        assert_eq!(topic, TopicId::new("done", "wf-9"));
    }

    #[tokio::test]
    async fn run_returns_completion_state() {
        let runtime = Runtime::builder()
            .agent(forward("start", "workflow-completion"))
            .build()
            .unwrap();
        let result = runtime
            .run(
                "start",
                WorkflowState::new("wf-1").with("n", json!(3)),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(result.get("n"), Some(&json!(3)));
        assert!(runtime.bus().completions().is_empty());
    }

    #[tokio::test]
    async fn run_unrouted_entry_cleans_up() {
        let runtime = Runtime::builder().build().unwrap();
        let err = runtime
            .run("missing", WorkflowState::new("wf-1"), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::UnroutedTopic(_)));
        assert!(runtime.bus().completions().is_empty());
        assert!(!runtime.bus().has_workflow_scope(&CorrelationId::from("wf-1")));
    }

    #[tokio::test]
    async fn run_times_out_when_nothing_completes() {
        // the only route never fires
        let runtime = Runtime::builder()
            .agent(AgentDefinition::new("dead-end").route(RouteDefinition::when("false").to("x")))
            .build()
            .unwrap();
        let err = runtime
            .run("dead-end", WorkflowState::new("wf-1"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::CompletionTimeout(_)));
        assert!(runtime.bus().completions().is_empty());
        let cid = CorrelationId::from("wf-1");
        assert!(eventually(|| !runtime.bus().has_workflow_scope(&cid)).await);
    }

    #[tokio::test]
    async fn cancelled_run_stops_waiting() {
        let runtime = Runtime::builder()
            .agent(AgentDefinition::new("dead-end"))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = runtime
            .run_with_cancel("dead-end", WorkflowState::new("wf-1"), None, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Cancelled));
    }
}
