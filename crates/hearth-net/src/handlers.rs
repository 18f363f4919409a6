//! Handler registries for the two channels.
//!
//! The room channel has a single slot: only one conversation view is ever
//! active, so registering replaces whatever was there and the previous
//! [`RoomSubscription`] stops being active. The notification channel keeps
//! an ordered set of handlers keyed by [`HandlerId`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use hearth_shared::ServerFrame;

/// Callback invoked for every parsed inbound frame.
pub type FrameHandler = Arc<dyn Fn(&ServerFrame) + Send + Sync>;

/// Identity of a notification handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

// ---------------------------------------------------------------------------
// Room channel: single slot
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RoomHandlerSlot {
    current: Mutex<Option<(u64, FrameHandler)>>,
    next_generation: AtomicU64,
}

impl RoomHandlerSlot {
    pub(crate) fn replace(self: &Arc<Self>, handler: FrameHandler) -> RoomSubscription {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.lock().replace((generation, handler));
        if let Some((old, _)) = previous {
            debug!(old, new = generation, "room handler replaced");
        }
        RoomSubscription {
            generation,
            slot: Arc::downgrade(self),
        }
    }

    pub(crate) fn clear(&self) -> bool {
        self.lock().take().is_some()
    }

    fn clear_if(&self, generation: u64) -> bool {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some((current, _)) if *current == generation => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.lock().as_ref().map(|(generation, _)| *generation)
    }

    pub(crate) fn dispatch(&self, frame: &ServerFrame) {
        let handler = self.lock().as_ref().map(|(_, h)| h.clone());
        match handler {
            Some(handler) => handler(frame),
            None => trace!(kind = frame.kind(), "no room handler registered, frame dropped"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(u64, FrameHandler)>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capability returned by
/// [`TransportManager::set_room_handler`](crate::TransportManager::set_room_handler).
///
/// It stops being active as soon as any other room handler is registered,
/// so a view that forgot to unregister can tell it is no longer subscribed.
#[derive(Debug)]
pub struct RoomSubscription {
    generation: u64,
    slot: Weak<RoomHandlerSlot>,
}

impl RoomSubscription {
    pub fn is_active(&self) -> bool {
        self.slot
            .upgrade()
            .and_then(|slot| slot.current_generation())
            == Some(self.generation)
    }

    /// Unregister. Does nothing (and returns `false`) if this registration
    /// was already replaced.
    pub fn cancel(self) -> bool {
        self.slot
            .upgrade()
            .map_or(false, |slot| slot.clear_if(self.generation))
    }
}

impl std::fmt::Debug for RoomHandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandlerSlot")
            .field("generation", &self.current_generation())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Notification channel: ordered multi-handler set
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct NotificationHandlers {
    handlers: Mutex<Vec<(HandlerId, FrameHandler)>>,
    next_id: AtomicU64,
}

impl NotificationHandlers {
    pub(crate) fn add(&self, handler: FrameHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Invoke every handler once, in registration order. The list is
    /// snapshotted first so handlers may add or remove registrations.
    pub(crate) fn dispatch(&self, frame: &ServerFrame) {
        let snapshot: Vec<FrameHandler> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        if snapshot.is_empty() {
            trace!(kind = frame.kind(), "no notification handlers, frame dropped");
        }
        for handler in snapshot {
            handler(frame);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, FrameHandler)>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
