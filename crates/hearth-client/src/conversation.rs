//! One visible conversation.
//!
//! Opening a conversation resolves the room key, opens the room channel and
//! fetches the backlog concurrently. Live frames are queued from the moment
//! the room handler is registered and only merged once the backlog is in,
//! so the list never shows a live message ahead of its history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use hearth_net::{ConnectionStatus, RoomSubscription, TransportError, TransportManager};
use hearth_shared::crypto::encrypt_text;
use hearth_shared::{ChannelKind, EncryptedMessage, FamilyId, RoomId, RoomKey, ServerFrame};

use crate::error::{ClientError, HistoryError};
use crate::events::{ConversationEvent, EVENT_CAPACITY};
use crate::history::HistorySource;
use crate::keyring::Keyring;
use crate::message::{insert_by_id, DecryptedMessage};

/// Frames the room handler forwards to the pump.
enum Inbound {
    Message(EncryptedMessage),
    Error(String),
}

#[derive(Default)]
struct State {
    messages: Vec<DecryptedMessage>,
    key: Option<RoomKey>,
}

struct Shared {
    room: RoomId,
    active: AtomicBool,
    state: Mutex<State>,
    events: broadcast::Sender<ConversationEvent>,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn merge_history(&self, fetched: Result<Vec<EncryptedMessage>, HistoryError>) {
        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                warn!(room = %self.room, error = %e, "history fetch failed");
                self.emit(ConversationEvent::HistoryFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let records: Vec<EncryptedMessage> =
            records.into_iter().filter(|r| r.room == self.room).collect();
        let count = records.len();
        let mut failed = 0;
        {
            let mut state = self.state();
            let Some(key) = state.key.clone() else {
                warn!(room = %self.room, "no room key, history dropped");
                return;
            };
            for record in &records {
                let message = DecryptedMessage::open(record, &key);
                if !message.decrypted {
                    failed += 1;
                }
                insert_by_id(&mut state.messages, message);
            }
        }

        info!(room = %self.room, count, failed, "history loaded");
        self.emit(ConversationEvent::HistoryLoaded { count, failed });
        if count > 0 {
            self.emit(ConversationEvent::ScrollToNewest);
        }
    }

    fn accept_live(&self, record: EncryptedMessage) {
        let id = record.id;
        let decrypted = {
            let mut state = self.state();
            // Checked under the lock so nothing lands after close().
            if !self.is_active() {
                debug!(room = %self.room, id = %id, "conversation closed, frame discarded");
                return;
            }
            let Some(key) = state.key.as_ref() else {
                warn!(room = %self.room, id = %id, "no room key, frame discarded");
                return;
            };
            let message = DecryptedMessage::open(&record, key);
            let decrypted = message.decrypted;
            if !insert_by_id(&mut state.messages, message) {
                trace!(room = %self.room, id = %id, "duplicate message ignored");
                return;
            }
            decrypted
        };

        if !decrypted {
            self.emit(ConversationEvent::DecryptFailed { id });
        }
        self.emit(ConversationEvent::MessageAppended { id });
        self.emit(ConversationEvent::ScrollToNewest);
    }
}

/// Drives a single room: key, channel, backlog and live stream.
pub struct ConversationController {
    room: RoomId,
    family: FamilyId,
    transport: Arc<TransportManager>,
    keyring: Arc<Keyring>,
    history: Arc<dyn HistorySource>,
    shared: Arc<Shared>,
    subscription: Mutex<Option<RoomSubscription>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    status_forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationController {
    pub fn new(
        room: RoomId,
        family: FamilyId,
        transport: Arc<TransportManager>,
        keyring: Arc<Keyring>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            room,
            family,
            transport,
            keyring,
            history,
            shared: Arc::new(Shared {
                room,
                active: AtomicBool::new(true),
                state: Mutex::new(State::default()),
                events,
            }),
            subscription: Mutex::new(None),
            pump: Mutex::new(None),
            status_forwarder: Mutex::new(None),
        }
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    pub fn family(&self) -> FamilyId {
        self.family
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the merged message list, ordered by id.
    pub fn messages(&self) -> Vec<DecryptedMessage> {
        self.shared.state().messages.clone()
    }

    pub fn is_key_ready(&self) -> bool {
        self.shared.state().key.is_some()
    }

    /// Resolve the room key, open the room channel and load history.
    ///
    /// History is merged even when the channel fails to open; the connection
    /// error is returned afterwards.
    pub async fn open(&self, token: &str) -> Result<(), ClientError> {
        info!(room = %self.room, family = %self.family, "opening conversation");
        self.establish(token).await
    }

    /// Reopen the room channel and fetch history again to fill the gap.
    /// Messages already shown are not duplicated.
    pub async fn reconnect(&self, token: &str) -> Result<(), ClientError> {
        info!(room = %self.room, "reconnecting conversation");
        self.establish(token).await
    }

    async fn establish(&self, token: &str) -> Result<(), ClientError> {
        if !self.is_active() {
            return Err(ClientError::Closed);
        }

        self.start_status_forwarder();
        let inbound = self.attach();

        let existing_key = self.shared.state().key.clone();
        let key_task = async {
            match existing_key {
                Some(key) => Ok(key),
                None => self.keyring.room_key(self.room, self.family).await,
            }
        };

        let (key, connected, fetched) = tokio::join!(
            key_task,
            self.transport.connect_to_room(self.room, token),
            self.history.fetch(self.room, token),
        );

        if !self.is_active() {
            debug!(room = %self.room, "closed while opening");
            return Err(ClientError::Closed);
        }

        match key {
            Ok(key) => self.shared.state().key = Some(key),
            Err(e) => {
                warn!(room = %self.room, error = %e, "room key unavailable");
                // The queue attach() handed out is dropped here; a later
                // open must register afresh and start a new pump.
                self.detach();
                self.transport.disconnect_room_if(self.room);
                return Err(e);
            }
        }

        self.shared.merge_history(fetched);

        if let Some(inbound) = inbound {
            let handle = tokio::spawn(pump(self.shared.clone(), inbound));
            if let Some(old) = self.lock(&self.pump).replace(handle) {
                old.abort();
            }
        }

        connected.map_err(|e| {
            warn!(room = %self.room, error = %e, "room channel did not open");
            ClientError::from(e)
        })
    }

    /// Register this conversation as the room handler unless it still is
    /// and its pump is running. Returns the queue of frames for a new pump.
    fn attach(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        let mut subscription = self.lock(&self.subscription);
        let pumping = self
            .lock(&self.pump)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if pumping && subscription.as_ref().is_some_and(RoomSubscription::is_active) {
            return None;
        }
        if let Some(stale) = subscription.take() {
            stale.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let room = self.room;
        *subscription = Some(self.transport.set_room_handler(move |frame| match frame {
            ServerFrame::Message(message) if message.room == room => {
                let _ = tx.send(Inbound::Message(message.clone()));
            }
            ServerFrame::Message(message) => {
                trace!(room = %room, other = %message.room, "frame for another room ignored");
            }
            ServerFrame::Error { message } => {
                let _ = tx.send(Inbound::Error(message.clone()));
            }
            other => trace!(room = %room, kind = other.kind(), "frame ignored"),
        }));
        Some(rx)
    }

    fn detach(&self) {
        if let Some(subscription) = self.lock(&self.subscription).take() {
            subscription.cancel();
        }
    }

    fn start_status_forwarder(&self) {
        let mut forwarder = self.lock(&self.status_forwarder);
        if forwarder.is_none() {
            let status = self.transport.room_status();
            *forwarder = Some(tokio::spawn(forward_status(self.shared.clone(), status)));
        }
    }

    /// Encrypt and send `text`. The message shows up in the list when the
    /// server broadcasts it back.
    pub fn send(&self, text: &str) -> Result<(), ClientError> {
        if !self.is_active() {
            return Err(ClientError::Closed);
        }
        if self.transport.current_room() != Some(self.room) {
            return Err(TransportError::NotConnected.into());
        }

        let envelope = {
            let state = self.shared.state();
            let key = state.key.as_ref().ok_or(ClientError::KeyNotReady)?;
            encrypt_text(key, text)?
        };
        self.transport.send_envelope(envelope)?;
        debug!(room = %self.room, "message sent");
        Ok(())
    }

    /// Stop this conversation. The notification channel is left alone, and
    /// the room channel is only closed if it still belongs to this room.
    pub fn close(&self) {
        {
            // Flip under the state lock so the pump cannot append afterwards.
            let _state = self.shared.state();
            if !self.shared.active.swap(false, Ordering::SeqCst) {
                return;
            }
        }

        self.detach();
        self.transport.disconnect_room_if(self.room);

        for task in [&self.pump, &self.status_forwarder] {
            if let Some(handle) = self.lock(task).take() {
                handle.abort();
            }
        }
        info!(room = %self.room, "conversation closed");
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        if !shared.is_active() {
            break;
        }
        match item {
            Inbound::Message(record) => shared.accept_live(record),
            Inbound::Error(message) => {
                warn!(room = %shared.room, message = %message, "server reported an error");
                shared.emit(ConversationEvent::ServerError { message });
            }
        }
    }
    trace!(room = %shared.room, "pump ended");
}

/// Reports the room channel's latest status. `watch` keeps only the newest
/// value, so a quick Open then Closed may surface as Closed alone.
async fn forward_status(shared: Arc<Shared>, mut status: watch::Receiver<ConnectionStatus>) {
    let kind = ChannelKind::Room(shared.room);
    while status.changed().await.is_ok() {
        if !shared.is_active() {
            break;
        }
        let current = status.borrow_and_update().clone();
        if current.kind() == Some(kind) {
            shared.emit(ConversationEvent::Connection(current));
        }
    }
}
