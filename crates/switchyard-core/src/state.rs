use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::types::{CorrelationId, Scope, WorkflowState};

/// Walk a dotted path (`a.b.0.c`) into a JSON value.
///
/// Numeric segments index into sequences; `a[0]` is accepted as `a.0`.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = normalize_path(path);
    let mut current = value;
    for segment in normalized.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Split a path into its root key and the remainder.
pub fn split_root(path: &str) -> (&str, Option<&str>) {
    let end = path.find(['.', '[']).unwrap_or(path.len());
    let (head, rest) = path.split_at(end);
    let rest = rest.trim_start_matches('.');
    if rest.is_empty() {
        (head, None)
    } else {
        (head, Some(rest))
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('[', ".").replace(']', "")
}

/// The Workflow-scope layer of one correlation id.
///
/// Cloning shares the same underlying map; concurrent branches see each
/// other's writes, last writer wins per key.
#[derive(Debug, Clone, Default)]
pub struct WorkflowScope {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl WorkflowScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    pub async fn snapshot(&self) -> Map<String, Value> {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Whether two handles point at the same layer.
    pub fn same_layer(&self, other: &WorkflowScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Layered state owned by a single pipeline invocation.
///
/// Reads check the Step layer, then Agent, then Workflow; the first hit wins.
/// Step-scope writes made by step N become readable by step N+1 only.
#[derive(Debug)]
pub struct ScopedState {
    correlation_id: CorrelationId,
    step: Map<String, Value>,
    pending_step: Map<String, Value>,
    agent: Map<String, Value>,
    workflow: WorkflowScope,
}

impl ScopedState {
    /// Seed a fresh invocation from the published state.
    pub fn new(incoming: WorkflowState, workflow: WorkflowScope) -> Self {
        Self {
            correlation_id: incoming.correlation_id,
            step: Map::new(),
            pending_step: Map::new(),
            agent: incoming.data,
            workflow,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Resolve a path across the layers.
    pub async fn resolve(&self, path: &str) -> Option<Value> {
        let (root, rest) = split_root(path);
        let value = match self.step.get(root).or_else(|| self.agent.get(root)) {
            Some(v) => v.clone(),
            None => self.workflow.get(root).await?,
        };
        match rest {
            Some(rest) => lookup_path(&value, rest).cloned(),
            None => Some(value),
        }
    }

    /// Record an output at the given scope.
    pub async fn write(&mut self, key: impl Into<String>, value: Value, scope: Scope) {
        let key = key.into();
        match scope {
            Scope::Step => {
                self.pending_step.insert(key, value);
            }
            Scope::Agent => {
                self.agent.insert(key, value);
            }
            Scope::Workflow => self.workflow.set(key, value).await,
        }
    }

    /// Move to the next step: the previous step's Step-scope writes are
    /// dropped and the current step's become visible.
    pub fn advance_step(&mut self) {
        self.step = std::mem::take(&mut self.pending_step);
    }

    pub fn step_layer(&self) -> &Map<String, Value> {
        &self.step
    }

    pub fn agent_layer(&self) -> &Map<String, Value> {
        &self.agent
    }

    pub fn workflow(&self) -> &WorkflowScope {
        &self.workflow
    }

    /// Workflow layer overlaid by the Agent layer; Step scope is not included.
    pub async fn merged(&self) -> WorkflowState {
        let mut data = self.workflow.snapshot().await;
        for (k, v) in &self.agent {
            data.insert(k.clone(), v.clone());
        }
        WorkflowState {
            correlation_id: self.correlation_id.clone(),
            data,
        }
    }

    /// The state forwarded by a route without a transform.
    pub fn into_outgoing(self) -> WorkflowState {
        WorkflowState {
            correlation_id: self.correlation_id,
            data: self.agent,
        }
    }

    pub fn outgoing(&self) -> WorkflowState {
        WorkflowState {
            correlation_id: self.correlation_id.clone(),
            data: self.agent.clone(),
        }
    }
}
