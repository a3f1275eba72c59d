//! In-process lobby notifications
//!
//! Subscribers get a token back and remove themselves with it. Emission
//! walks a snapshot of the current subscribers, so a callback may subscribe
//! or unsubscribe without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ws::protocol::{PlayerId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyEvent {
    PlayerLoggedIn(PlayerId),
    PlayerLoggedOff(PlayerId),
    RoomCreated(RoomId),
    RoomLaunched(RoomId),
    RoomDestroyed(RoomId),
}

/// Token returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&LobbyEvent) + Send + Sync>;

#[derive(Default)]
pub struct LobbyEvents {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
}

impl LobbyEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&LobbyEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the token was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: LobbyEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Counters kept current from lobby events, served on `/health`
#[derive(Debug, Default)]
pub struct LobbyStats {
    pub players_online: AtomicU64,
    pub rooms_open: AtomicU64,
    pub rooms_launched: AtomicU64,
}

impl LobbyStats {
    /// Create the counters and keep them updated from `events`
    pub fn attach(events: &LobbyEvents) -> Arc<Self> {
        let stats = Arc::new(Self::default());
        let sink = stats.clone();
        events.subscribe(move |event| sink.apply(event));
        stats
    }

    fn apply(&self, event: &LobbyEvent) {
        match event {
            LobbyEvent::PlayerLoggedIn(_) => {
                self.players_online.fetch_add(1, Ordering::Relaxed);
            }
            LobbyEvent::PlayerLoggedOff(_) => decrement(&self.players_online),
            LobbyEvent::RoomCreated(_) => {
                self.rooms_open.fetch_add(1, Ordering::Relaxed);
            }
            LobbyEvent::RoomLaunched(_) => {
                self.rooms_launched.fetch_add(1, Ordering::Relaxed);
            }
            LobbyEvent::RoomDestroyed(_) => decrement(&self.rooms_open),
        }
    }
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}
