use tokio::sync::broadcast;

use crate::types::RuntimeEvent;

/// Buffered runtime events per subscriber when no capacity is configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out of `RuntimeEvent`s to observers.
///
/// Observers that fall more than `capacity` events behind lose the oldest
/// ones and see `RecvError::Lagged`; the runtime itself never waits on them.
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit `event`, returning how many observers it reached.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn observers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicId;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(RuntimeEvent::AgentStarted {
            topic: TopicId::new("a", "wf"),
        });
        match rx.recv().await.unwrap() {
            RuntimeEvent::AgentStarted { topic } => assert_eq!(topic.topic(), "a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_observers_reaches_nobody() {
        let bus = EventBus::new(4);
        let done = || RuntimeEvent::Completed {
            topic: TopicId::new("done", "wf"),
        };
        assert_eq!(bus.publish(done()), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.observers(), 1);
        assert_eq!(bus.publish(done()), 1);
    }
}
