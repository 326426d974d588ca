//! Real-time event fan-out
//!
//! Events are published into tenant-prefixed rooms; WebSocket connections
//! subscribe to the rooms of the conversations they have joined. Room names
//! are always built server-side so a client can never address another
//! tenant's room.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Per-room broadcast buffer depth
const ROOM_CAPACITY: usize = 64;

/// An event delivered to operator clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new message landed in a conversation
    MessageNew {
        conversation_id: i64,
        message_id: String,
        direction: String,
        kind: String,
        content: Option<String>,
        media_url: Option<String>,
        sent_at: String,
    },
    /// Delivery status changed for a message
    MessageStatus {
        conversation_id: i64,
        message_id: String,
        status: String,
        error: Option<String>,
    },
    /// Someone is typing in a conversation
    ConversationTyping {
        conversation_id: i64,
        user_id: Option<i64>,
        typing: bool,
    },
    /// An operator connected to the tenant room
    UserOnline { user_id: i64 },
    /// A scheduled reminder was delivered to the customer
    ReminderSent {
        conversation_id: i64,
        reminder_id: i64,
    },
}

/// Room name for a conversation, always tenant-prefixed
#[must_use]
pub fn conversation_room(tenant_id: i64, conversation_id: i64) -> String {
    format!("tenant:{tenant_id}:conversation:{conversation_id}")
}

/// Tenant-wide presence room
#[must_use]
pub fn tenant_room(tenant_id: i64) -> String {
    format!("tenant:{tenant_id}")
}

/// Pub/sub seam
///
/// The in-process [`EventHub`] is the default backbone; a shared broker
/// implementation can replace it for multi-instance deployments.
pub trait Backbone: Send + Sync {
    /// Publish an event to a room
    fn publish(&self, room: &str, event: Event);

    /// Subscribe to a room's event stream
    fn subscribe(&self, room: &str) -> broadcast::Receiver<Event>;
}

/// In-process event hub keyed by room name
#[derive(Default)]
pub struct EventHub {
    rooms: RwLock<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, room: &str) -> broadcast::Sender<Event> {
        if let Some(tx) = self
            .rooms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(room)
        {
            return tx.clone();
        }

        let mut rooms = self
            .rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }
}

impl EventHub {
    fn drop_if_idle(&self, room: &str) {
        let mut rooms = self
            .rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if rooms.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room);
        }
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Backbone for EventHub {
    fn publish(&self, room: &str, event: Event) {
        match self.sender(room).send(event) {
            Ok(delivered) => tracing::trace!(room, delivered, "published event"),
            // No receivers is fine; nobody has the conversation open.
            // Reclaim the channel so abandoned rooms do not accumulate.
            Err(_) => self.drop_if_idle(room),
        }
    }

    fn subscribe(&self, room: &str) -> broadcast::Receiver<Event> {
        self.sender(room).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_names_are_tenant_prefixed() {
        assert_eq!(conversation_room(7, 42), "tenant:7:conversation:42");
        assert_eq!(tenant_room(7), "tenant:7");
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe(&conversation_room(1, 1));

        hub.publish(
            &conversation_room(1, 1),
            Event::MessageStatus {
                conversation_id: 1,
                message_id: "m1".to_string(),
                status: "read".to_string(),
                error: None,
            },
        );

        match rx.recv().await.unwrap() {
            Event::MessageStatus { status, .. } => assert_eq!(status, "read"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = EventHub::new();
        let mut tenant_a = hub.subscribe(&conversation_room(1, 1));
        let _tenant_b = hub.subscribe(&conversation_room(2, 1));

        hub.publish(
            &conversation_room(2, 1),
            Event::UserOnline { user_id: 5 },
        );

        assert!(matches!(
            tenant_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_abandoned_rooms_are_reclaimed() {
        let hub = EventHub::new();
        let rx = hub.subscribe(&conversation_room(1, 1));
        assert_eq!(hub.room_count(), 1);

        drop(rx);
        hub.publish(&conversation_room(1, 1), Event::UserOnline { user_id: 1 });
        assert_eq!(hub.room_count(), 0);

        // A live subscriber keeps its room alive through a publish
        let _rx = hub.subscribe(&conversation_room(1, 2));
        hub.publish(&conversation_room(1, 2), Event::UserOnline { user_id: 1 });
        assert_eq!(hub.room_count(), 1);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = Event::ConversationTyping {
            conversation_id: 3,
            user_id: Some(1),
            typing: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation_typing");
        assert_eq!(json["conversation_id"], 3);
    }
}
