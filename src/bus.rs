use crate::transport::socket::ConnectionState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// The session ended on the client's side: token missing, expired, or
    /// rejected by the server. Consumers should return to the login screen.
    ForcedLogout { reason: String },

    /// The shared socket changed state
    Connection(ConnectionState),

    /// A user-visible notice (e.g. a request failed on the network)
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.publish(Event::Notification {
            level,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::ForcedLogout {
            reason: "token expired".into(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                Event::ForcedLogout { reason } => assert_eq!(reason, "token expired"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.notify(NotificationLevel::Warning, "offline");
    }

    #[test]
    fn events_serialize_tagged() {
        let event = Event::Connection(ConnectionState::Connected);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Connection");
        assert_eq!(json["data"], "Connected");
    }
}
