use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use switchyard_core::config::PauseQueuePolicy;
use switchyard_core::types::TopicId;

/// Suspend flags keyed by topic identity, with the publishes held meanwhile.
pub struct PauseController<T> {
    policy: PauseQueuePolicy,
    paused: Mutex<HashMap<TopicId, VecDeque<T>>>,
}

impl<T> PauseController<T> {
    pub fn new(policy: PauseQueuePolicy) -> Self {
        Self {
            policy,
            paused: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> PauseQueuePolicy {
        self.policy
    }

    /// Pause `topic`. Returns false if it was already paused.
    pub fn pause(&self, topic: &TopicId) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if paused.contains_key(topic) {
            return false;
        }
        paused.insert(topic.clone(), VecDeque::new());
        true
    }

    /// Unpause `topic`, handing back everything held for it in arrival order.
    pub fn resume(&self, topic: &TopicId) -> Vec<T> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn is_paused(&self, topic: &TopicId) -> bool {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Hold `item` if `topic` is paused, returning the queue depth.
    /// Gives the item back when the topic is not paused.
    pub fn hold(&self, topic: &TopicId, item: T) -> std::result::Result<usize, T> {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = paused.get_mut(topic) else {
            return Err(item);
        };
        if self.policy == PauseQueuePolicy::Latest {
            queue.clear();
        }
        queue.push_back(item);
        Ok(queue.len())
    }

    /// Number of publishes held for `topic`.
    pub fn queued(&self, topic: &TopicId) -> usize {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, VecDeque::len)
    }

    /// Every currently paused identity.
    pub fn paused_topics(&self) -> Vec<TopicId> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
