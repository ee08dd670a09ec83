use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use switchyard_core::state::WorkflowScope;
use switchyard_core::types::CorrelationId;

type Entries = Arc<Mutex<HashMap<CorrelationId, Entry>>>;

#[derive(Default)]
struct Entry {
    scope: WorkflowScope,
    /// Accepted publishes not yet finished: in flight, queued or held by a pause.
    live: usize,
    /// A driver is still waiting on a completion for this correlation id.
    awaited: bool,
}

impl Entry {
    fn idle(&self) -> bool {
        self.live == 0 && !self.awaited
    }
}

/// Workflow-scope layers keyed by correlation id.
///
/// The only state shared between invocations. Distinct correlation ids never
/// share a layer. A layer lives while any publish of its workflow is
/// outstanding or a completion is awaited, and is dropped once neither holds.
#[derive(Clone, Default)]
pub struct WorkflowStore {
    entries: Entries,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the layer of `correlation_id` alive for one accepted publish.
    pub fn lease(&self, correlation_id: &CorrelationId) -> WorkflowLease {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(correlation_id.clone()).or_default();
        entry.live += 1;
        WorkflowLease {
            correlation_id: correlation_id.clone(),
            scope: entry.scope.clone(),
            entries: self.entries.clone(),
        }
    }

    /// The layer of a correlation id, if the workflow is still running.
    pub fn scope(&self, correlation_id: &CorrelationId) -> Option<WorkflowScope> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(correlation_id)
            .map(|e| e.scope.clone())
    }

    /// A driver waits on this workflow's completion; keep the layer until it
    /// resolves or is abandoned.
    pub fn await_completion(&self, correlation_id: &CorrelationId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(correlation_id.clone()).or_default().awaited = true;
    }

    /// The awaited completion resolved, or the driver gave up on it.
    ///
    /// Returns whether the layer was dropped now; otherwise it goes once
    /// outstanding publishes finish.
    pub fn settle(&self, correlation_id: &CorrelationId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(correlation_id) else {
            return false;
        };
        entry.awaited = false;
        if entry.idle() {
            entries.remove(correlation_id);
            debug!(correlation_id = %correlation_id, "Released workflow scope");
            return true;
        }
        false
    }

    /// Outstanding publishes for a correlation id.
    pub fn live(&self, correlation_id: &CorrelationId) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(correlation_id)
            .map_or(0, |e| e.live)
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a workflow's layer open while one publish is outstanding.
pub struct WorkflowLease {
    correlation_id: CorrelationId,
    scope: WorkflowScope,
    entries: Entries,
}

impl WorkflowLease {
    pub fn scope(&self) -> &WorkflowScope {
        &self.scope
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(&self.correlation_id) else {
            return;
        };
        entry.live = entry.live.saturating_sub(1);
        if entry.idle() {
            entries.remove(&self.correlation_id);
            debug!(correlation_id = %self.correlation_id, "Released workflow scope");
        }
    }
}

impl std::fmt::Debug for WorkflowLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLease")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}
