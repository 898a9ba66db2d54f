use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::events::RelayEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Event bus {bus} is closed")]
    Closed { bus: String },
    #[error("Event bus {bus} rejected the event: {message}")]
    Rejected { bus: String, message: String },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: RelayEnvelope) -> Result<(), PublishError>;
}

/// In-process event bus: every published envelope is forwarded to a single
/// receiver and kept in a log for inspection.
#[derive(Debug)]
pub struct MemoryEventBus {
    name: String,
    sender: mpsc::UnboundedSender<RelayEnvelope>,
    log: Mutex<Vec<RelayEnvelope>>,
}

impl MemoryEventBus {
    pub fn channel(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RelayEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let bus = Self {
            name: name.into(),
            sender,
            log: Mutex::new(Vec::new()),
        };
        (bus, receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn published(&self) -> Vec<RelayEnvelope> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, envelope: RelayEnvelope) -> Result<(), PublishError> {
        debug!(
            bus = %self.name,
            event_id = %envelope.id,
            detail_type = %envelope.detail_type,
            "Publishing relay event"
        );
        if let Ok(mut log) = self.log.lock() {
            log.push(envelope.clone());
        }
        self.sender.send(envelope).map_err(|_| PublishError::Closed {
            bus: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_delivers_and_logs() {
        let (bus, mut rx) = MemoryEventBus::channel("spoke");
        let envelope = RelayEnvelope::new("src", "type", &json!({"a": 1})).unwrap();
        bus.publish(envelope.clone()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), envelope);
        assert_eq!(bus.published(), vec![envelope]);
    }

    #[tokio::test]
    async fn test_publish_to_closed_bus() {
        let (bus, rx) = MemoryEventBus::channel("hub");
        drop(rx);
        let envelope = RelayEnvelope::new("src", "type", &json!({})).unwrap();
        assert!(matches!(bus.publish(envelope).await, Err(PublishError::Closed { .. })));
    }
}
