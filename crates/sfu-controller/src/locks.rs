//! Per-room and per-participant locks.
//!
//! Locks are async mutexes created lazily per key and held for a whole
//! critical section, including awaited media engine calls. Acquisition order
//! is room before participant. The nested form
//! [`LockManager::lock_participant_in`] borrows the room guard, so the
//! participant guard cannot outlive the room guard it was taken under.
//! Nothing acquires a room lock while holding a participant lock.
//!
//! Handles are reaped by [`LockManager::sweep`] once their key is gone from
//! the registry and nobody holds or awaits them.

use crate::observability::metrics;
use crate::registry::Registry;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Handle = Arc<AsyncMutex<()>>;

struct KeyedLocks {
    kind: &'static str,
    handles: Mutex<HashMap<String, Handle>>,
}

impl KeyedLocks {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, Handle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let handle = Arc::clone(self.handles().entry(key.to_string()).or_default());
        let started = Instant::now();
        let guard = handle.lock_owned().await;
        metrics::record_lock_wait(self.kind, started.elapsed());
        guard
    }

    /// Drop handles for dead keys. A handle with other strong references is
    /// held or awaited right now and survives until the next sweep.
    fn sweep(&self, is_live: impl Fn(&str) -> bool) -> usize {
        let mut handles = self.handles();
        let before = handles.len();
        handles.retain(|key, handle| is_live(key) || Arc::strong_count(handle) > 1);
        before - handles.len()
    }

    fn len(&self) -> usize {
        self.handles().len()
    }
}

/// Exclusive access to one room.
pub struct RoomGuard {
    room_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl RoomGuard {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

/// Exclusive access to one participant.
///
/// `'r` ties a nested guard to the room guard it was acquired under;
/// standalone guards are `'static`.
pub struct ParticipantGuard<'r> {
    uid: String,
    _guard: OwnedMutexGuard<()>,
    _room: PhantomData<&'r RoomGuard>,
}

impl ParticipantGuard<'_> {
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

/// Issues room and participant locks.
pub struct LockManager {
    rooms: KeyedLocks,
    participants: KeyedLocks,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: KeyedLocks::new("room"),
            participants: KeyedLocks::new("participant"),
        }
    }

    pub async fn lock_room(&self, room_id: &str) -> RoomGuard {
        RoomGuard {
            room_id: room_id.to_string(),
            _guard: self.rooms.acquire(room_id).await,
        }
    }

    /// Lock a participant for an operation that does not touch room
    /// membership or router assignment.
    pub async fn lock_participant(&self, uid: &str) -> ParticipantGuard<'static> {
        ParticipantGuard {
            uid: uid.to_string(),
            _guard: self.participants.acquire(uid).await,
            _room: PhantomData,
        }
    }

    /// Lock a participant while holding its room.
    pub async fn lock_participant_in<'r>(
        &self,
        _room: &'r RoomGuard,
        uid: &str,
    ) -> ParticipantGuard<'r> {
        ParticipantGuard {
            uid: uid.to_string(),
            _guard: self.participants.acquire(uid).await,
            _room: PhantomData,
        }
    }

    /// Reap handles whose key is absent from the registry. Returns the
    /// number of room and participant handles removed.
    pub fn sweep(&self, registry: &Registry) -> (usize, usize) {
        let rooms = self.rooms.sweep(|room_id| registry.has_room(room_id));
        let participants = self
            .participants
            .sweep(|uid| registry.room_of(uid).is_some());
        (rooms, participants)
    }

    /// Number of live room and participant handles.
    pub fn handle_counts(&self) -> (usize, usize) {
        (self.rooms.len(), self.participants.len())
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        registry: Arc<Registry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(target: "sfu.locks", "Lock sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let (rooms, participants) = self.sweep(&registry);
                        let (live_rooms, live_participants) = self.handle_counts();
                        debug!(
                            target: "sfu.locks",
                            reaped_rooms = rooms,
                            reaped_participants = participants,
                            live_rooms,
                            live_participants,
                            "Lock sweep complete"
                        );
                    }
                }
            }
        })
    }
}
