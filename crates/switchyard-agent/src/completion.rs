use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::types::{TopicId, WorkflowState};

type SharedResult = Shared<BoxFuture<'static, Option<WorkflowState>>>;
type Slots = Arc<Mutex<HashMap<TopicId, Slot>>>;

struct Slot {
    generation: u64,
    sender: Option<oneshot::Sender<WorkflowState>>,
    result: SharedResult,
}

/// Resolved identities remembered after their registration is gone.
pub const DEFAULT_RESOLVED_HISTORY: usize = 1024;

/// Oldest-first record of resolved identities, capped at `capacity`.
struct ResolvedLog {
    order: VecDeque<TopicId>,
    members: HashSet<TopicId>,
    capacity: usize,
}

impl ResolvedLog {
    fn insert(&mut self, topic: &TopicId) {
        if self.capacity == 0 || !self.members.insert(topic.clone()) {
            return;
        }
        self.order.push_back(topic.clone());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }
}

/// Outcome of a publish landing on a termination topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The pending completion was resolved with the published state.
    Resolved,
    /// Already resolved; the publish was ignored.
    AlreadyResolved,
}

/// Pending completions keyed by exact topic identity.
///
/// Registration is idempotent and each registration resolves at most once.
/// Entries are removed when a waiter observes the result or gives up. The
/// most recent resolved identities stay known afterwards, so a late publish
/// to one is ignored instead of being unrouted.
pub struct CompletionRegistrar {
    slots: Slots,
    resolved: Mutex<ResolvedLog>,
    next_generation: AtomicU64,
}

impl Default for CompletionRegistrar {
    fn default() -> Self {
        Self::with_history(DEFAULT_RESOLVED_HISTORY)
    }
}

impl CompletionRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember up to `history` resolved identities.
    pub fn with_history(history: usize) -> Self {
        Self {
            slots: Slots::default(),
            resolved: Mutex::new(ResolvedLog {
                order: VecDeque::new(),
                members: HashSet::new(),
                capacity: history,
            }),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Return the completion for `topic`, registering it on first access.
    pub fn get_or_create(&self, topic: &TopicId) -> CompletionHandle {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(topic.clone()).or_insert_with(|| {
            let (tx, rx) = oneshot::channel::<WorkflowState>();
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %topic, generation, "Registered completion");
            Slot {
                generation,
                sender: Some(tx),
                result: rx.map(|r| r.ok()).boxed().shared(),
            }
        });

        CompletionHandle {
            topic: topic.clone(),
            generation: slot.generation,
            result: slot.result.clone(),
            slots: self.slots.clone(),
        }
    }

    pub fn is_registered(&self, topic: &TopicId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Whether `topic` resolved recently, observed or not.
    pub fn is_resolved(&self, topic: &TopicId) -> bool {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains(topic)
    }

    /// A publish to `topic` lands here rather than on a handler.
    pub fn accepts(&self, topic: &TopicId) -> bool {
        self.is_registered(topic) || self.is_resolved(topic)
    }

    /// Resolve the completion registered for `topic`.
    ///
    /// Hands the state back when nothing is registered for that identity and
    /// it has not resolved before.
    pub fn resolve(
        &self,
        topic: &TopicId,
        state: WorkflowState,
    ) -> std::result::Result<Resolution, WorkflowState> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.get_mut(topic) else {
            if self.is_resolved(topic) {
                return Ok(Resolution::AlreadyResolved);
            }
            return Err(state);
        };
        match slot.sender.take() {
            Some(tx) => {
                // recorded before the waiter can observe and drop the slot
                self.resolved
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(topic);
                // the receiver lives in the slot, so this cannot fail
                let _ = tx.send(state);
                Ok(Resolution::Resolved)
            }
            None => Ok(Resolution::AlreadyResolved),
        }
    }

    /// Drop a registration; outstanding waiters observe `CompletionAbandoned`.
    pub fn abandon(&self, topic: &TopicId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some()
    }

    /// Number of registrations not yet observed.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An awaitable completion for one topic identity.
///
/// Clones and repeated `get_or_create` calls share the same registration.
#[derive(Clone)]
pub struct CompletionHandle {
    topic: TopicId,
    generation: u64,
    result: SharedResult,
    slots: Slots,
}

impl CompletionHandle {
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Whether two handles refer to the same registration.
    pub fn same_registration(&self, other: &CompletionHandle) -> bool {
        self.topic == other.topic && self.generation == other.generation
    }

    /// True once some waiter of this registration has received the result.
    pub fn is_resolved(&self) -> bool {
        matches!(self.result.peek(), Some(Some(_)))
    }

    /// Wait for the result, bounded by `timeout`.
    ///
    /// Observing the result or timing out removes the registration.
    pub async fn wait(self, timeout: Duration) -> Result<WorkflowState> {
        match tokio::time::timeout(timeout, self.result.clone()).await {
            Ok(Some(state)) => {
                self.release();
                Ok(state)
            }
            Ok(None) => {
                self.release();
                Err(SwitchyardError::CompletionAbandoned(self.topic.clone()))
            }
            Err(_) => {
                warn!(topic = %self.topic, timeout_ms = timeout.as_millis() as u64, "Completion timed out, abandoning");
                self.release();
                Err(SwitchyardError::CompletionTimeout(self.topic.clone()))
            }
        }
    }

    /// Like `wait`, but also gives up when `cancel` fires.
    pub async fn wait_or_cancel(
        self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState> {
        let guard = self.clone();
        tokio::select! {
            r = self.wait(timeout) => r,
            _ = cancel.cancelled() => {
                guard.release();
                Err(SwitchyardError::Cancelled)
            }
        }
    }

    /// Give up on this completion.
    pub fn abandon(&self) {
        self.release();
    }

    fn release(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&self.topic)
            .is_some_and(|s| s.generation == self.generation)
        {
            slots.remove(&self.topic);
            debug!(topic = %self.topic, "Released completion");
        }
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("topic", &self.topic)
            .field("generation", &self.generation)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
