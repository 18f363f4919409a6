//! Unread counters fed by the notification channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use hearth_net::{HandlerId, TransportManager};
use hearth_shared::{RoomId, RoomNotification, ServerFrame};

#[derive(Default)]
struct Counters {
    per_room: HashMap<RoomId, usize>,
    open_room: Option<RoomId>,
}

impl Counters {
    fn record(&mut self, notification: &RoomNotification) {
        if self.open_room == Some(notification.room_id) {
            trace!(room = %notification.room_id, "notification for open room ignored");
            return;
        }
        *self.per_room.entry(notification.room_id).or_default() += 1;
    }
}

/// Counts `room_message` notifications per room, skipping the room the user
/// is currently looking at.
pub struct UnreadTracker {
    transport: Arc<TransportManager>,
    counters: Arc<Mutex<Counters>>,
    handler: Mutex<Option<HandlerId>>,
}

impl UnreadTracker {
    /// Register on the notification channel of `transport`.
    pub fn attach(transport: Arc<TransportManager>) -> Self {
        let counters = Arc::new(Mutex::new(Counters::default()));
        let sink = counters.clone();
        let handler = transport.add_notification_handler(move |frame| {
            if let ServerFrame::RoomMessage(notification) = frame {
                lock(&sink).record(notification);
            }
        });
        debug!("unread tracker attached");

        Self {
            transport,
            counters,
            handler: Mutex::new(Some(handler)),
        }
    }

    /// Set the room on screen. Its counter is cleared and stays at zero
    /// while it remains open.
    pub fn set_open_room(&self, room: Option<RoomId>) {
        let mut counters = lock(&self.counters);
        counters.open_room = room;
        if let Some(room) = room {
            counters.per_room.remove(&room);
        }
    }

    pub fn mark_read(&self, room: RoomId) {
        lock(&self.counters).per_room.remove(&room);
    }

    pub fn unread(&self, room: RoomId) -> usize {
        lock(&self.counters).per_room.get(&room).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> usize {
        lock(&self.counters).per_room.values().sum()
    }

    /// Stop counting. Returns `false` if already detached.
    pub fn detach(&self) -> bool {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match handler {
            Some(id) => self.transport.remove_notification_handler(id),
            None => false,
        }
    }
}

impl Drop for UnreadTracker {
    fn drop(&mut self) {
        self.detach();
    }
}

fn lock(counters: &Mutex<Counters>) -> MutexGuard<'_, Counters> {
    counters
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use hearth_net::testing::TestServer;
    use hearth_shared::MessageId;

    use super::*;

    fn notification(room: i64) -> RoomNotification {
        RoomNotification {
            room_id: RoomId(room),
            message_id: MessageId(1),
            sender: None,
            sender_username: None,
            created_at: None,
        }
    }

    #[test]
    fn test_counters_skip_open_room() {
        let mut counters = Counters {
            open_room: Some(RoomId(5)),
            ..Default::default()
        };
        counters.record(&notification(5));
        counters.record(&notification(42));
        counters.record(&notification(42));

        assert_eq!(counters.per_room.get(&RoomId(42)), Some(&2));
        assert!(!counters.per_room.contains_key(&RoomId(5)));
    }

    #[tokio::test]
    async fn test_tracker_counts_notifications() {
        let mut server = TestServer::start().await.unwrap();
        let transport = Arc::new(TransportManager::new(server.config().unwrap()));
        let tracker = UnreadTracker::attach(transport.clone());
        tracker.set_open_room(Some(RoomId(5)));

        transport.connect_to_notifications("t").await.unwrap();
        let mut conn = server.next_connection().await.unwrap();

        for room in ["5", "42", "42"] {
            conn.send_json(&json!({
                "type": "room_message",
                "room_id": room,
                "message_id": 1,
                "sender": 2,
                "sender_username": "bo",
                "created_at": "2024-05-01T10:00:00",
            }))
            .await;
        }

        let counted = tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.total_unread() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(counted.is_ok());
        assert_eq!(tracker.unread(RoomId(42)), 2);
        assert_eq!(tracker.unread(RoomId(5)), 0);

        tracker.mark_read(RoomId(42));
        assert_eq!(tracker.total_unread(), 0);

        assert!(tracker.detach());
        assert!(!tracker.detach());
        assert_eq!(transport.notification_handler_count(), 0);
    }
}
