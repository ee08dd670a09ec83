use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SwitchyardError};
use crate::types::Scope;

/// Top-level Switchyard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Documented step contracts. Not required for an agent to use a step type.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl SwitchyardConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SwitchyardError::ConfigNotFound(path.display().to_string()))?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), agents = config.agents.len(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| SwitchyardError::Config(e.to_string()))
    }

    /// Look up an agent definition by topic name.
    pub fn agent(&self, topic: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.topic == topic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Reserved topic name whose publish resolves a pending completion.
    #[serde(default = "default_completion_topic")]
    pub completion_topic: String,
    #[serde(default)]
    pub route_policy: RoutePolicy,
    #[serde(default)]
    pub pause_queue: PauseQueuePolicy,
    /// Default bound on how long a driver waits for completion.
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Upper bound on publishes chained from one initial publish.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            completion_topic: default_completion_topic(),
            route_policy: RoutePolicy::default(),
            pause_queue: PauseQueuePolicy::default(),
            completion_timeout_secs: default_completion_timeout(),
            event_capacity: default_event_capacity(),
            max_hops: default_max_hops(),
        }
    }
}

fn default_completion_topic() -> String {
    "workflow-completion".to_string()
}
fn default_completion_timeout() -> u64 {
    300
}
fn default_event_capacity() -> usize {
    crate::event::DEFAULT_EVENT_CAPACITY
}
fn default_max_hops() -> usize {
    64
}

/// How many truthy routes fire per invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Every route whose condition holds fires, in declaration order.
    #[default]
    FanOut,
    /// Only the first route whose condition holds fires.
    FirstMatch,
}

/// What a paused topic retains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseQueuePolicy {
    /// Keep only the most recent publish.
    #[default]
    Latest,
    /// Keep every publish in arrival order.
    All,
}

/// Declared contract of a step type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Logical input name -> expected kind.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Logical output name -> produced kind.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl StepDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), kind.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), kind.into());
        self
    }
}

/// An agent: a pipeline of steps bound to one topic, plus its routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub topic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<StepInstance>,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    /// Overrides `runtime.route_policy` for this agent.
    #[serde(default)]
    pub route_policy: Option<RoutePolicy>,
}

impl AgentDefinition {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            description: String::new(),
            steps: vec![],
            routes: vec![],
            route_policy: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: StepInstance) -> Self {
        self.steps.push(step);
        self
    }

    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.route_policy = Some(policy);
        self
    }
}

/// One use of a step type inside an agent's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub step_type: String,
    /// Display name; defaults to the step type.
    #[serde(default)]
    pub name: Option<String>,
    /// Logical input name -> state path.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Logical output name -> destination key and scope.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputBinding>,
    #[serde(default)]
    pub config: Value,
}

impl StepInstance {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            name: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            config: Value::Null,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), path.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>, key: impl Into<String>, scope: Scope) -> Self {
        self.outputs.insert(
            name.into(),
            OutputBinding {
                key: key.into(),
                scope,
            },
        );
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step_type)
    }
}

/// Where a step output is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OutputBindingRepr")]
pub struct OutputBinding {
    pub key: String,
    pub scope: Scope,
}

/// Accepts either `"key"` (Agent scope) or `{ key = "...", scope = "..." }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum OutputBindingRepr {
    Key(String),
    Full {
        key: String,
        #[serde(default)]
        scope: Scope,
    },
}

impl From<OutputBindingRepr> for OutputBinding {
    fn from(repr: OutputBindingRepr) -> Self {
        match repr {
            OutputBindingRepr::Key(key) => Self {
                key,
                scope: Scope::Agent,
            },
            OutputBindingRepr::Full { key, scope } => Self { key, scope },
        }
    }
}

/// Conditional rule selecting downstream topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub condition: String,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub transform: Option<String>,
}

impl RouteDefinition {
    pub fn when(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            receivers: vec![],
            transform: None,
        }
    }

    /// A route whose condition always holds.
    pub fn always() -> Self {
        Self::when("true")
    }

    pub fn to(mut self, receiver: impl Into<String>) -> Self {
        self.receivers.push(receiver.into());
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }
}

/// Substitute each `${NAME}` with the value of environment variable `NAME`.
///
/// Unset variables and an unterminated `${` are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let reference = &rest[start..];
        let Some(end) = reference.find('}') else {
            out.push_str(reference);
            return out;
        };
        match std::env::var(&reference[2..end]) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&reference[..=end]),
        }
        rest = &reference[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let config = SwitchyardConfig::from_toml_str("").unwrap();
        assert_eq!(config.runtime.completion_topic, "workflow-completion");
        assert_eq!(config.runtime.route_policy, RoutePolicy::FanOut);
        assert_eq!(config.runtime.pause_queue, PauseQueuePolicy::Latest);
        assert_eq!(config.runtime.max_hops, 64);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn output_binding_accepts_both_forms() {
        let toml = r#"
[[agents]]
topic = "a"

[[agents.steps]]
step_type = "constant"
outputs = { plain = "k1", scoped = { key = "k2", scope = "workflow" }, step_only = { key = "k3", scope = "step" } }
"#;
        let config = SwitchyardConfig::from_toml_str(toml).unwrap();
        let outputs = &config.agents[0].steps[0].outputs;
        assert_eq!(outputs["plain"], OutputBinding { key: "k1".into(), scope: Scope::Agent });
        assert_eq!(outputs["scoped"].scope, Scope::Workflow);
        assert_eq!(outputs["step_only"].scope, Scope::Step);
    }

    #[test]
    fn env_vars_expand_and_unknown_stay_verbatim() {
        std::env::set_var("SWITCHYARD_TEST_TOPIC", "from-env");
        let out = expand_env_vars("topic = \"${SWITCHYARD_TEST_TOPIC}\" x = \"${SWITCHYARD_UNSET_VAR_XYZ}\"");
        assert!(out.contains("from-env"));
        assert!(out.contains("${SWITCHYARD_UNSET_VAR_XYZ}"));
    }

    #[test]
    fn unterminated_reference_is_kept() {
        std::env::set_var("SWITCHYARD_TEST_PREFIX", "wf");
        assert_eq!(expand_env_vars("${SWITCHYARD_TEST_PREFIX}-${OPEN"), "wf-${OPEN");
        assert_eq!(expand_env_vars("cost = \"$5\""), "cost = \"$5\"");
    }

    #[test]
    fn builders_compose() {
        let agent = AgentDefinition::new("validate-query")
            .with_description("validates")
            .step(
                StepInstance::new("deserialize")
                    .input("text", "validation_raw_json")
                    .output("value", "validation_result", Scope::Agent),
            )
            .route(RouteDefinition::when("validation_result.is_valid = true").to("answer"))
            .with_route_policy(RoutePolicy::FirstMatch);

        assert_eq!(agent.steps[0].display_name(), "deserialize");
        assert_eq!(agent.routes[0].receivers, vec!["answer"]);
        assert_eq!(agent.route_policy, Some(RoutePolicy::FirstMatch));
        assert_eq!(RouteDefinition::always().condition, "true");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = SwitchyardConfig::from_toml_str("[[agents]]\ntopic = 5").unwrap_err();
        assert!(matches!(err, SwitchyardError::Config(_)));
    }
}
