use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SwitchyardError};
use crate::state::{lookup_path, split_root};

/// Identifier tying every message and state write of one workflow run together.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a publish: a topic name qualified by a correlation id.
///
/// The same topic name under two correlation ids is two distinct addresses.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TopicId {
    topic: String,
    correlation_id: CorrelationId,
}

impl TopicId {
    pub fn new(topic: impl Into<String>, correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            topic: topic.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Same correlation id, different topic name.
    pub fn sibling(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

impl std::fmt::Display for TopicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.topic, self.correlation_id)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Visibility lifetime of a state write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible to the next step of the same pipeline invocation only.
    Step,
    /// Visible for the rest of the agent invocation and forwarded on publish.
    #[default]
    Agent,
    /// Shared by every invocation under the same correlation id.
    Workflow,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => write!(f, "step"),
            Self::Agent => write!(f, "agent"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// The unit of data carried between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl WorkflowState {
    pub fn new(correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            data: Map::new(),
        }
    }

    /// Build a state from a JSON value, which must be an object.
    pub fn from_value(correlation_id: impl Into<CorrelationId>, value: Value) -> Result<Self> {
        match value {
            Value::Object(data) => Ok(Self {
                correlation_id: correlation_id.into(),
                data,
            }),
            other => Err(SwitchyardError::Config(format!(
                "workflow state must be a JSON object, got {}",
                kind_of(&other)
            ))),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Dotted path lookup, e.g. `validation_result.is_valid`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let (head, rest) = split_root(path);
        let root = self.data.get(head)?;
        match rest {
            Some(rest) => lookup_path(root, rest),
            None => Some(root),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

/// Short name of a JSON value's kind, used in error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Observable runtime events.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A publish was accepted for dispatch.
    Published { topic: TopicId, at: DateTime<Utc> },
    /// A publish was held because its topic is paused.
    Queued { topic: TopicId, depth: usize },
    /// A paused topic was resumed, releasing `released` publishes.
    Resumed { topic: TopicId, released: usize },
    /// An agent invocation began.
    AgentStarted { topic: TopicId },
    /// A step in a pipeline committed its outputs.
    StepCompleted {
        topic: TopicId,
        step: String,
        index: usize,
        elapsed_ms: u64,
    },
    /// An agent invocation finished its pipeline and routing.
    AgentCompleted {
        topic: TopicId,
        routes_matched: usize,
        elapsed_ms: u64,
    },
    /// An agent invocation aborted.
    AgentFailed { topic: TopicId, error: String },
    /// A route condition evaluated truthy.
    RouteMatched {
        topic: TopicId,
        route: usize,
        receivers: Vec<String>,
    },
    /// A termination topic resolved its pending completion.
    Completed { topic: TopicId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_identity_requires_both_fields() {
        let a = TopicId::new("validate-query", "wf-1");
        let b = TopicId::new("validate-query", "wf-1");
        let c = TopicId::new("validate-query", "wf-2");
        let d = TopicId::new("answer-query", "wf-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn sibling_keeps_correlation() {
        let a = TopicId::new("validate-query", "wf-1");
        let b = a.sibling("workflow-completion");
        assert_eq!(b.topic(), "workflow-completion");
        assert_eq!(b.correlation_id().as_str(), "wf-1");
    }

    #[test]
    fn correlation_id_parses_from_str() {
        let parsed: CorrelationId = "wf-7".parse().unwrap();
        assert_eq!(parsed, CorrelationId::from("wf-7"));
        assert_eq!(parsed.to_string(), "wf-7");
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn state_from_non_object_is_rejected() {
        assert!(WorkflowState::from_value("wf", json!([1, 2])).is_err());
        let state = WorkflowState::from_value("wf", json!({"a": 1})).unwrap();
        assert_eq!(state.get("a"), Some(&json!(1)));
    }

    #[test]
    fn state_path_lookup() {
        let state = WorkflowState::new("wf")
            .with("validation_result", json!({"is_valid": false, "tags": ["x", "y"]}));
        assert_eq!(state.get_path("validation_result.is_valid"), Some(&json!(false)));
        assert_eq!(state.get_path("validation_result.tags.1"), Some(&json!("y")));
        assert_eq!(state.get_path("validation_result.missing"), None);
        assert_eq!(state.get_path("nope"), None);
    }

    #[test]
    fn scope_serde_is_lowercase() {
        let scope: Scope = serde_json::from_value(json!("workflow")).unwrap();
        assert_eq!(scope, Scope::Workflow);
        assert_eq!(Scope::default(), Scope::Agent);
    }
}
