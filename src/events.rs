use crate::models::{Agent, MessageRecord};
use tokio::sync::broadcast;

/// Relay-internal events, consumed by the webhook dispatcher and (later)
/// any SSE subscribers. Deliberately narrower than a general pub/sub bus:
/// ADMP only needs to react to delivery and lifecycle transitions.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    MessageDelivered(MessageRecord),
    MessageAcked(MessageRecord),
    MessageDead(MessageRecord),
    AgentRegistered(Agent),
    AgentHeartbeatMissed(String),
}

#[derive(Clone)]
pub struct EventBus {
    pub sender: broadcast::Sender<RelayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}
