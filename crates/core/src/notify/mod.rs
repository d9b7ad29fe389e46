//! Push notifications for sync state changes.
//!
//! The status registry publishes every transition through a
//! [`NotificationChannel`]. The production channel is a
//! [`BroadcastChannel`] whose receivers are handed to websocket clients, so
//! dashboards get updates without polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Topic for provider status transitions and progress.
pub const SYNC_STATUS_TOPIC: &str = "sync:status";

/// Default broadcast buffer. Slow subscribers past this lag and are told so.
const DEFAULT_CAPACITY: usize = 256;

/// A fire-and-forget publish/subscribe sink.
///
/// `publish` must never block: it is called from the registry's request
/// loop.
pub trait NotificationChannel: Send + Sync {
    fn publish(&self, topic: &str, message: serde_json::Value);
}

/// The JSON envelope sent to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// [`NotificationChannel`] backed by a `tokio::sync::broadcast` channel of
/// serialized [`Envelope`]s.
#[derive(Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<String>,
}

impl BroadcastChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every envelope published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel for BroadcastChannel {
    fn publish(&self, topic: &str, message: serde_json::Value) {
        let envelope = Envelope {
            topic: topic.to_string(),
            payload: message,
        };
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                // An error only means nobody is subscribed right now.
                if self.tx.send(text).is_err() {
                    trace!(topic, "no notification subscribers");
                }
            }
            Err(e) => trace!(topic, error = %e, "failed to serialize notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let channel = BroadcastChannel::new();
        let mut rx = channel.subscribe();

        channel.publish(SYNC_STATUS_TOPIC, serde_json::json!({"provider": "calibre"}));

        let text = rx.recv().await.unwrap();
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.topic, SYNC_STATUS_TOPIC);
        assert_eq!(envelope.payload["provider"], "calibre");
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let channel = BroadcastChannel::new();
        channel.publish(SYNC_STATUS_TOPIC, serde_json::json!({}));
    }
}
