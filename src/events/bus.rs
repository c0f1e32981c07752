//! Broadcast bus for execution events.
//!
//! Events are observational: publishing never fails, and a bus with no
//! subscribers simply drops them. Slow subscribers lose the oldest events
//! (broadcast semantics) rather than blocking publishers.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::{EventPayload, ExecutionEvent};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, payload: EventPayload) {
        let event = ExecutionEvent::new(payload);
        // send only errors when no receiver exists; that is fine here.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ExecutionEvent>,
}

impl EventReceiver {
    /// Next event, or None once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Event receiver lagged");
                    continue;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }
}
