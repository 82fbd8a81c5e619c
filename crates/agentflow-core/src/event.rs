use crate::types::RunEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all run events, across runs.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunEventKind, RunId};

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(RunEvent {
            run_id: RunId::from_str("r"),
            sequence: 0,
            timestamp: chrono::Utc::now(),
            kind: RunEventKind::RunStarted,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.sequence, 0);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(RunEvent {
            run_id: RunId::new(),
            sequence: 0,
            timestamp: chrono::Utc::now(),
            kind: RunEventKind::CancelRequested,
        });
    }
}
