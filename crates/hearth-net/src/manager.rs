//! Owner of the two WebSocket channels.
//!
//! The manager is shared behind an `Arc` and holds at most one room channel
//! and one notification channel. Every connect call starts a new *epoch* for
//! its slot: the previous channel is closed first, and an attempt that is
//! overtaken while still connecting never gets installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info};

use hearth_shared::{ChannelKind, ClientFrame, Envelope, RoomId, ServerFrame};

use crate::channel::{Channel, ChannelState, CloseReason, ConnectionStatus, StatusPublisher};
use crate::endpoint::TransportConfig;
use crate::error::{ConnectFailure, TransportError};
use crate::handlers::{FrameHandler, HandlerId, NotificationHandlers, RoomHandlerSlot, RoomSubscription};

#[derive(Default)]
struct SlotInner {
    channel: Option<Channel>,
    target: Option<ChannelKind>,
}

struct Slot {
    inner: Mutex<SlotInner>,
    epoch: Arc<AtomicU64>,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl Slot {
    fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            inner: Mutex::new(SlotInner::default()),
            epoch: Arc::new(AtomicU64::new(0)),
            status: Arc::new(status),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new attempt for `kind`: older attempts go stale and the
    /// current channel is closed before anything new is opened.
    fn begin(&self, kind: ChannelKind) -> StatusPublisher {
        let mine = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = {
            let mut inner = self.lock();
            inner.target = Some(kind);
            inner.channel.take()
        };
        if let Some(previous) = previous {
            debug!(old = %previous.kind(), new = %kind, "replacing channel");
            previous.close();
        }
        StatusPublisher::new(self.status.clone(), self.epoch.clone(), mine)
    }

    fn install(&self, channel: Channel, publisher: &StatusPublisher) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !publisher.is_current() {
            drop(inner);
            let kind = channel.kind();
            debug!(channel = %kind, "connect superseded, discarding channel");
            channel.close();
            return Err(TransportError::Connection {
                channel: kind,
                reason: ConnectFailure::Superseded,
            });
        }
        inner.channel = Some(channel);
        Ok(())
    }

    /// Close the current channel and cancel any attempt still in flight.
    fn disconnect(&self) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let (channel, target) = {
            let mut inner = self.lock();
            (inner.channel.take(), inner.target.take())
        };

        let was_live = match &channel {
            Some(channel) => channel.state() == ChannelState::Open,
            None => self.status.borrow().state() == ChannelState::Connecting,
        };
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(kind) = target {
            if was_live {
                self.status.send_replace(ConnectionStatus::Closed {
                    kind,
                    reason: CloseReason::Local,
                });
            }
        }
        was_live
    }

    fn target(&self) -> Option<ChannelKind> {
        self.lock().target
    }

    fn state(&self) -> ChannelState {
        self.status.borrow().state()
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        match &self.lock().channel {
            Some(channel) => channel.send_text(text),
            None => Err(TransportError::NotConnected),
        }
    }
}

/// Lifecycle and routing for the room and notification channels.
pub struct TransportManager {
    config: TransportConfig,
    room: Slot,
    notifications: Slot,
    room_handler: Arc<RoomHandlerSlot>,
    notification_handlers: Arc<NotificationHandlers>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            room: Slot::new(),
            notifications: Slot::new(),
            room_handler: Arc::new(RoomHandlerSlot::default()),
            notification_handlers: Arc::new(NotificationHandlers::default()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // -- room channel -------------------------------------------------------

    /// Open the room channel for `room`, replacing any existing one.
    ///
    /// Resolves once the channel is `OPEN`. Frames that arrive on the
    /// previous room channel are never dispatched after this is called.
    pub async fn connect_to_room(&self, room: RoomId, token: &str) -> Result<(), TransportError> {
        let kind = ChannelKind::Room(room);
        let url = self.config.channel_url(kind, token)?;
        let publisher = self.room.begin(kind);

        let handler = self.room_handler.clone();
        let gate = publisher.clone();
        let dispatch: FrameHandler = Arc::new(move |frame: &ServerFrame| {
            if gate.is_current() {
                handler.dispatch(frame);
            }
        });

        let channel = Channel::connect(kind, &url, self.config.open_grace, dispatch, publisher.clone()).await?;
        self.room.install(channel, &publisher)?;
        info!(room = %room, "room channel ready");
        Ok(())
    }

    /// Send an encrypted chat message on the room channel.
    pub fn send_message(&self, ciphertext: &str, iv: &str) -> Result<(), TransportError> {
        let frame = ClientFrame::Message {
            ciphertext: ciphertext.to_string(),
            iv: iv.to_string(),
        };
        self.room.send_text(frame.to_json()?)?;
        debug!("message queued");
        Ok(())
    }

    pub fn send_envelope(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.room.send_text(ClientFrame::message(envelope).to_json()?)?;
        debug!("message queued");
        Ok(())
    }

    /// Register the single room handler, replacing the previous one.
    pub fn set_room_handler<F>(&self, handler: F) -> RoomSubscription
    where
        F: Fn(&ServerFrame) + Send + Sync + 'static,
    {
        self.room_handler.replace(Arc::new(handler))
    }

    pub fn clear_room_handler(&self) -> bool {
        self.room_handler.clear()
    }

    pub fn disconnect_room(&self) -> bool {
        let closed = self.room.disconnect();
        if closed {
            info!("room channel disconnected");
        }
        closed
    }

    /// Disconnect only if the room channel currently targets `room`. Lets a
    /// view that is going away leave a newer view's connection alone.
    pub fn disconnect_room_if(&self, room: RoomId) -> bool {
        if self.room.target() != Some(ChannelKind::Room(room)) {
            return false;
        }
        self.disconnect_room()
    }

    pub fn room_state(&self) -> ChannelState {
        self.room.state()
    }

    /// Room whose channel is currently `OPEN`.
    pub fn current_room(&self) -> Option<RoomId> {
        match *self.room.status.borrow() {
            ConnectionStatus::Open(ChannelKind::Room(room)) => Some(room),
            _ => None,
        }
    }

    pub fn room_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.room.status.subscribe()
    }

    // -- notification channel ----------------------------------------------

    pub async fn connect_to_notifications(&self, token: &str) -> Result<(), TransportError> {
        let kind = ChannelKind::Notifications;
        let url = self.config.channel_url(kind, token)?;
        let publisher = self.notifications.begin(kind);

        let handlers = self.notification_handlers.clone();
        let dispatch: FrameHandler = Arc::new(move |frame: &ServerFrame| handlers.dispatch(frame));

        let channel = Channel::connect(kind, &url, self.config.open_grace, dispatch, publisher.clone()).await?;
        self.notifications.install(channel, &publisher)?;
        info!("notification channel ready");
        Ok(())
    }

    /// Add a notification handler. Handlers run in registration order.
    pub fn add_notification_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ServerFrame) + Send + Sync + 'static,
    {
        self.notification_handlers.add(Arc::new(handler))
    }

    pub fn remove_notification_handler(&self, id: HandlerId) -> bool {
        self.notification_handlers.remove(id)
    }

    pub fn notification_handler_count(&self) -> usize {
        self.notification_handlers.len()
    }

    pub fn disconnect_notifications(&self) -> bool {
        let closed = self.notifications.disconnect();
        if closed {
            info!("notification channel disconnected");
        }
        closed
    }

    pub fn notification_state(&self) -> ChannelState {
        self.notifications.state()
    }

    pub fn notification_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.notifications.status.subscribe()
    }

    /// Close both channels.
    pub fn disconnect_all(&self) {
        self.disconnect_room();
        self.disconnect_notifications();
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::testing::{Behavior, TestServer};

    fn chat_frame(room: i64, id: i64) -> Value {
        json!({
            "type": "message",
            "id": id,
            "room": room,
            "ciphertext": "AAAA",
            "iv": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            "sender": 3,
            "sender_username": "ana",
            "created_at": "2024-05-01T10:00:00Z",
        })
    }

    /// Room handler that forwards `(room, id)` of every chat frame.
    fn record_room_frames(manager: &TransportManager) -> (RoomSubscription, mpsc::UnboundedReceiver<(i64, i64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = manager.set_room_handler(move |frame| {
            if let ServerFrame::Message(message) = frame {
                let _ = tx.send((message.room.0, message.id.0));
            }
        });
        (subscription, rx)
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionStatus>, state: ChannelState) -> ConnectionStatus {
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state() == state))
            .await
            .expect("timed out waiting for status")
            .expect("status sender dropped");
        status.clone()
    }

    #[tokio::test]
    async fn test_connect_room_passes_token_and_path() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());

        manager.connect_to_room(RoomId(42), "tok-1").await.unwrap();
        let conn = server.next_connection().await.unwrap();

        assert_eq!(conn.path, "/ws/chat/42/");
        assert_eq!(conn.token.as_deref(), Some("tok-1"));
        assert_eq!(manager.room_state(), ChannelState::Open);
        assert_eq!(manager.current_room(), Some(RoomId(42)));
    }

    #[tokio::test]
    async fn test_reconnect_delivers_only_newest_room() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());
        let (_subscription, mut frames) = record_room_frames(&manager);

        manager.connect_to_room(RoomId(1), "t").await.unwrap();
        let mut first = server.next_connection().await.unwrap();
        manager.connect_to_room(RoomId(2), "t").await.unwrap();
        let mut second = server.next_connection().await.unwrap();

        first.send_json(&chat_frame(1, 10)).await;
        second.send_json(&chat_frame(2, 20)).await;

        assert_eq!(recv(&mut frames).await, Some((2, 20)));
        assert!(first.closed_by_client().await);
        assert_eq!(manager.current_room(), Some(RoomId(2)));
    }

    #[tokio::test]
    async fn test_overlapping_connects_newest_wins() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());

        let (older, newer) = tokio::join!(
            manager.connect_to_room(RoomId(1), "t"),
            manager.connect_to_room(RoomId(2), "t"),
        );

        let err = older.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connection {
                reason: ConnectFailure::Superseded,
                ..
            }
        ));
        newer.unwrap();
        assert_eq!(manager.current_room(), Some(RoomId(2)));

        // drain both server sides so neither lingers
        assert!(server.next_connection().await.is_some());
        assert!(server.next_connection().await.is_some());
    }

    #[tokio::test]
    async fn test_send_requires_open_room_channel() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());

        let err = manager.send_message("Y2lwaGVy", "aXY=").unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));

        manager.connect_to_room(RoomId(5), "t").await.unwrap();
        let mut conn = server.next_connection().await.unwrap();
        manager.send_message("Y2lwaGVy", "aXY=").unwrap();

        let sent: Value = serde_json::from_str(&conn.next_text().await.unwrap()).unwrap();
        assert_eq!(
            sent,
            json!({"type": "message", "ciphertext": "Y2lwaGVy", "iv": "aXY="})
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_and_channel_stays_open() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());
        let (_subscription, mut frames) = record_room_frames(&manager);

        manager.connect_to_room(RoomId(9), "t").await.unwrap();
        let mut conn = server.next_connection().await.unwrap();

        conn.send_text("{not json").await;
        conn.send_json(&json!({"type": "message", "id": "nope"})).await;
        conn.send_json(&chat_frame(9, 1)).await;

        assert_eq!(recv(&mut frames).await, Some((9, 1)));
        assert_eq!(manager.room_state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_notification_handlers_each_called_in_order() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());
        let (tx, mut calls) = mpsc::unbounded_channel();

        let tx_a = tx.clone();
        manager.add_notification_handler(move |_| {
            let _ = tx_a.send("A");
        });
        manager.add_notification_handler(move |_| {
            let _ = tx.send("B");
        });

        manager.connect_to_notifications("t").await.unwrap();
        let mut conn = server.next_connection().await.unwrap();
        assert_eq!(conn.path, "/ws/chat/notifications/");

        conn.send_json(&json!({
            "type": "room_message",
            "room_id": "42",
            "message_id": 7,
            "sender": 3,
            "sender_username": "ana",
        }))
        .await;

        assert_eq!(recv(&mut calls).await, Some("A"));
        assert_eq!(recv(&mut calls).await, Some("B"));
    }

    #[tokio::test]
    async fn test_immediate_unauthorized_close_fails_connect() {
        let mut server = TestServer::start().await.unwrap();
        server.set_behavior(Behavior::CloseAfterUpgrade(4001));
        let manager = TransportManager::new(server.config().unwrap());
        let (_subscription, mut frames) = record_room_frames(&manager);

        let err = manager.connect_to_room(RoomId(42), "expired").await.unwrap_err();

        assert!(err.is_connection_error());
        assert!(err.is_authentication_error());
        assert_eq!(manager.room_state(), ChannelState::Closed);
        assert!(frames.try_recv().is_err());
        let _ = server.next_connection().await;
    }

    #[tokio::test]
    async fn test_http_rejection_fails_connect() {
        let server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());

        server.set_behavior(Behavior::RejectHttp(403));
        let err = manager.connect_to_room(RoomId(1), "t").await.unwrap_err();
        assert!(err.is_authentication_error());

        server.set_behavior(Behavior::RejectHttp(500));
        let err = manager.connect_to_room(RoomId(1), "t").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connection {
                reason: ConnectFailure::Rejected { status: 500 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_remote_close_marks_channel_closed() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());
        let mut status = manager.room_status();

        manager.connect_to_room(RoomId(3), "t").await.unwrap();
        let mut conn = server.next_connection().await.unwrap();
        conn.close(4000).await;

        let closed = wait_for_state(&mut status, ChannelState::Closed).await;
        assert_eq!(
            closed,
            ConnectionStatus::Closed {
                kind: ChannelKind::Room(RoomId(3)),
                reason: CloseReason::Remote { code: Some(4000) },
            }
        );
        assert!(matches!(
            manager.send_message("a", "b"),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_room_if_only_matches_target() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());

        manager.connect_to_room(RoomId(8), "t").await.unwrap();
        let mut conn = server.next_connection().await.unwrap();

        assert!(!manager.disconnect_room_if(RoomId(7)));
        assert_eq!(manager.room_state(), ChannelState::Open);

        assert!(manager.disconnect_room_if(RoomId(8)));
        assert_eq!(manager.room_state(), ChannelState::Closed);
        assert!(conn.closed_by_client().await);
        assert!(!manager.disconnect_room());
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let mut server = TestServer::start().await.unwrap();
        let manager = TransportManager::new(server.config().unwrap());

        manager.connect_to_notifications("t").await.unwrap();
        let _notifications = server.next_connection().await.unwrap();
        manager.connect_to_room(RoomId(1), "t").await.unwrap();
        let _room = server.next_connection().await.unwrap();

        manager.disconnect_room();
        assert_eq!(manager.room_state(), ChannelState::Closed);
        assert_eq!(manager.notification_state(), ChannelState::Open);
    }
}
