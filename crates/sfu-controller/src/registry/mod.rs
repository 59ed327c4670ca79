//! Room and participant registry.
//!
//! The registry is the only owner of room membership, participant records
//! and each room's producer index. Its internal map lock is held for short,
//! synchronous sections only. Mutations take lock guards from
//! [`LockManager`](crate::locks::LockManager) as proof that the caller holds
//! the matching room or participant lock:
//!
//! - membership changes need the room guard and the participant guard
//!   nested under it;
//! - per-participant changes need the participant guard.
//!
//! Producer slots and index entries are written together, so a room's index
//! always has exactly one entry per open producer.

pub mod participant;
pub mod producer_index;
pub mod room;

pub use participant::{
    ConsumerRecord, Participant, ParticipantMetadata, ParticipantSummary, PendingConsumer,
    ProducerRecord, StreamKind, TransportRecord, Transports,
};
pub use producer_index::{IndexedStream, ProducerIndex, StreamInfo};
pub use room::Room;

use crate::errors::SfuError;
use crate::locks::{ParticipantGuard, RoomGuard};
use crate::observability::metrics;
use crate::session::state::{SessionEvent, SessionState};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Room>,
    /// uid -> room id, for every participant in any room.
    user_rooms: HashMap<String, String>,
}

impl RegistryState {
    fn publish_gauges(&self) {
        metrics::set_rooms_active(self.rooms.len() as u64);
        metrics::set_participants_active(self.user_rooms.len() as u64);
    }
}

/// Fields applied by [`Registry::upsert_participant`]. `None` leaves the
/// current value in place.
#[derive(Debug, Default)]
pub struct ParticipantUpdate {
    pub connection_id: Option<String>,
    pub metadata: Option<ParticipantMetadata>,
    pub rtp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub inserted: bool,
    pub previous: SessionState,
    pub current: SessionState,
}

/// A participant taken out of its room.
#[derive(Debug)]
pub struct RemovedParticipant {
    pub participant: Participant,
    pub room_emptied: bool,
}

/// Point-in-time copy of a participant, for listings and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub uid: String,
    pub room_id: String,
    pub state: SessionState,
    pub connection_id: Option<String>,
    pub metadata: ParticipantMetadata,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
    pub pending_consumers: Vec<PendingConsumer>,
    pub send_transport: Option<TransportRecord>,
    pub recv_transport: Option<TransportRecord>,
    pub cleanup_pending: bool,
}

/// Mutable access to one participant plus its room's producer index.
pub struct ParticipantMut<'a> {
    participant: &'a mut Participant,
    index: &'a mut ProducerIndex,
}

impl Deref for ParticipantMut<'_> {
    type Target = Participant;

    fn deref(&self) -> &Participant {
        self.participant
    }
}

impl DerefMut for ParticipantMut<'_> {
    fn deref_mut(&mut self) -> &mut Participant {
        self.participant
    }
}

impl ParticipantMut<'_> {
    /// Put a producer in its slot and index it. Returns the producer it
    /// replaced, already removed from the index.
    pub fn attach_producer(&mut self, record: ProducerRecord) -> Option<ProducerRecord> {
        let kind = record.kind;
        let previous = self.detach_producer(kind);
        self.index.insert(&record.id, &self.participant.uid, kind);
        *self.participant.producers.slot_mut(kind) = Some(record);
        previous
    }

    /// Empty a producer slot and drop its index entry.
    pub fn detach_producer(&mut self, kind: StreamKind) -> Option<ProducerRecord> {
        let previous = self.participant.producers.slot_mut(kind).take();
        if let Some(previous) = &previous {
            self.index.remove(&previous.id);
        }
        previous
    }

    /// Forget every media handle: producers with their index entries,
    /// consumers, transports and queued consume requests. Returns the ids of
    /// the detached producers.
    pub fn drop_media(&mut self) -> Vec<String> {
        let streams = [StreamKind::Audio, StreamKind::Video, StreamKind::Screen]
            .into_iter()
            .filter_map(|kind| self.detach_producer(kind))
            .map(|producer| producer.id)
            .collect();
        let participant = &mut *self.participant;
        participant.consumers.clear();
        participant.transports = Transports::default();
        participant.pending_expiry.cancel();
        participant.pending_consumers.clear();
        participant.metadata.mic_on = false;
        participant.metadata.video_on = false;
        streams
    }

    /// A stream published in this participant's room.
    pub fn stream(&self, stream_id: &str) -> Option<IndexedStream> {
        self.index.get(stream_id).cloned()
    }

    /// Streams in the room not published by this participant.
    pub fn other_streams(&self) -> Vec<StreamInfo> {
        self.index.streams(Some(&self.participant.uid))
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.state().rooms.contains_key(room_id)
    }

    /// The room a participant is in, if any.
    pub fn room_of(&self, uid: &str) -> Option<String> {
        self.state().user_rooms.get(uid).cloned()
    }

    /// Create the room record if absent. Returns true if it was created.
    pub fn ensure_room(&self, room: &RoomGuard) -> bool {
        let mut state = self.state();
        if state.rooms.contains_key(room.room_id()) {
            return false;
        }
        state
            .rooms
            .insert(room.room_id().to_string(), Room::new(room.room_id()));
        state.publish_gauges();
        debug!(target: "sfu.registry", room_id = %room.room_id(), "Room created");
        true
    }

    /// Insert the participant into the room or refresh an existing record,
    /// then apply `event` to its session state.
    ///
    /// A join cancels any pending cleanup timer; an announce leaves it
    /// running. Nothing is written when the transition is illegal or the
    /// participant is in another room.
    pub fn upsert_participant(
        &self,
        room: &RoomGuard,
        participant: &ParticipantGuard<'_>,
        event: SessionEvent,
        update: ParticipantUpdate,
    ) -> Result<Upserted, SfuError> {
        let room_id = room.room_id();
        let uid = participant.uid();
        let mut state = self.state();

        if let Some(current_room) = state.user_rooms.get(uid) {
            if current_room != room_id {
                return Err(SfuError::Conflict(format!(
                    "Participant {uid} is already in room {current_room}"
                )));
            }
        }

        let previous = state
            .rooms
            .get(room_id)
            .and_then(|r| r.participants.get(uid))
            .map_or(SessionState::Absent, |p| p.state);
        let current = previous.apply(event)?;

        let room_record = state
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));
        let inserted = !room_record.participants.contains_key(uid);
        let record = room_record
            .participants
            .entry(uid.to_string())
            .or_insert_with(|| Participant::new(uid));

        record.state = current;
        if event != SessionEvent::Announce {
            record.liveness.cancel();
        }
        if let Some(connection_id) = update.connection_id {
            record.connection_id = Some(connection_id);
        }
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        if let Some(rtp_capabilities) = update.rtp_capabilities {
            record.rtp_capabilities = Some(rtp_capabilities);
        }

        state
            .user_rooms
            .insert(uid.to_string(), room_id.to_string());
        state.publish_gauges();

        Ok(Upserted {
            inserted,
            previous,
            current,
        })
    }

    /// Run `f` against a participant record under the registry lock.
    ///
    /// `f` must not block; engine calls belong outside it.
    pub fn with_participant<R>(
        &self,
        participant: &ParticipantGuard<'_>,
        f: impl FnOnce(&mut ParticipantMut<'_>) -> Result<R, SfuError>,
    ) -> Result<R, SfuError> {
        let uid = participant.uid();
        let mut state = self.state();
        let room_id = state
            .user_rooms
            .get(uid)
            .cloned()
            .ok_or_else(|| SfuError::not_found("Participant", uid))?;
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| SfuError::not_found("Room", &room_id))?;
        let Room {
            participants,
            producer_index,
            ..
        } = room;
        let record = participants
            .get_mut(uid)
            .ok_or_else(|| SfuError::not_found("Participant", uid))?;
        f(&mut ParticipantMut {
            participant: record,
            index: producer_index,
        })
    }

    /// Take a participant out of its room and the index, cancel its timers,
    /// and delete the room if it is now empty.
    ///
    /// Returns `None` if the participant is not in this room, which makes
    /// repeated removal a no-op.
    pub fn remove_participant(
        &self,
        room: &RoomGuard,
        participant: &ParticipantGuard<'_>,
    ) -> Option<RemovedParticipant> {
        let room_id = room.room_id();
        let uid = participant.uid();
        let mut state = self.state();

        let room_record = state.rooms.get_mut(room_id)?;
        let mut removed = room_record.participants.remove(uid)?;
        for producer in removed.producers.iter() {
            room_record.producer_index.remove(&producer.id);
        }
        let room_emptied = room_record.participants.is_empty();

        removed.liveness.cancel();
        removed.pending_expiry.cancel();
        removed.pending_consumers.clear();
        removed.state = SessionState::Removed;

        if room_emptied {
            state.rooms.remove(room_id);
        }
        if state.user_rooms.get(uid).map(String::as_str) == Some(room_id) {
            state.user_rooms.remove(uid);
        }
        state.publish_gauges();

        Some(RemovedParticipant {
            participant: removed,
            room_emptied,
        })
    }

    /// Delete a room record that has no members left.
    pub fn remove_room_if_empty(&self, room: &RoomGuard) -> bool {
        let mut state = self.state();
        let empty = state
            .rooms
            .get(room.room_id())
            .is_some_and(|r| r.participants.is_empty());
        if empty {
            state.rooms.remove(room.room_id());
            state.publish_gauges();
        }
        empty
    }

    /// Members of a room, sorted by uid.
    pub fn participants(&self, room_id: &str) -> Vec<ParticipantSummary> {
        let state = self.state();
        let mut members: Vec<ParticipantSummary> = state
            .rooms
            .get(room_id)
            .map(|r| r.participants.values().map(Participant::summary).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.uid.cmp(&b.uid));
        members
    }

    /// Streams in a room, optionally excluding one publisher.
    pub fn streams(&self, room_id: &str, exclude_uid: Option<&str>) -> Vec<StreamInfo> {
        self.state()
            .rooms
            .get(room_id)
            .map(|r| r.producer_index.streams(exclude_uid))
            .unwrap_or_default()
    }

    /// Live connection ids of a room's members, optionally excluding one.
    pub fn connections(&self, room_id: &str, exclude_uid: Option<&str>) -> Vec<String> {
        self.state()
            .rooms
            .get(room_id)
            .map(|r| {
                r.participants
                    .values()
                    .filter(|p| Some(p.uid.as_str()) != exclude_uid)
                    .filter_map(|p| p.connection_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self, uid: &str) -> Option<ParticipantSnapshot> {
        let state = self.state();
        let room_id = state.user_rooms.get(uid)?;
        let p = state.rooms.get(room_id)?.participants.get(uid)?;
        let mut consumers: Vec<ConsumerRecord> = p.consumers.values().cloned().collect();
        consumers.sort_by(|a, b| a.id.cmp(&b.id));
        Some(ParticipantSnapshot {
            uid: p.uid.clone(),
            room_id: room_id.clone(),
            state: p.state,
            connection_id: p.connection_id.clone(),
            metadata: p.metadata.clone(),
            producers: p.producers.iter().cloned().collect(),
            consumers,
            pending_consumers: p.pending_consumers.clone(),
            send_transport: p.transports.send.clone(),
            recv_transport: p.transports.recv.clone(),
            cleanup_pending: p.cleanup_pending(),
        })
    }

    /// Index size and open producer count for a room.
    pub fn index_consistency(&self, room_id: &str) -> Option<(usize, usize)> {
        self.state()
            .rooms
            .get(room_id)
            .map(|r| (r.producer_index.len(), r.open_producer_count()))
    }

    /// Number of rooms and participants.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state();
        (state.rooms.len(), state.user_rooms.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::locks::LockManager;
    use std::time::Duration;

    fn producer(id: &str, kind: StreamKind) -> ProducerRecord {
        ProducerRecord {
            id: id.to_string(),
            kind,
            paused: false,
        }
    }

    async fn join(registry: &Registry, locks: &LockManager, room_id: &str, uid: &str) {
        let room = locks.lock_room(room_id).await;
        let participant = locks.lock_participant_in(&room, uid).await;
        registry
            .upsert_participant(
                &room,
                &participant,
                SessionEvent::Join,
                ParticipantUpdate {
                    connection_id: Some(format!("conn-{uid}")),
                    ..ParticipantUpdate::default()
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_refreshes() {
        let registry = Registry::new();
        let locks = LockManager::new();
        let room = locks.lock_room("room-1").await;
        let participant = locks.lock_participant_in(&room, "alice").await;

        let first = registry
            .upsert_participant(&room, &participant, SessionEvent::Join, ParticipantUpdate::default())
            .unwrap();
        assert!(first.inserted);
        assert_eq!(first.previous, SessionState::Absent);
        assert_eq!(first.current, SessionState::Active);

        let metadata = ParticipantMetadata {
            display_name: "Alice".to_string(),
            ..ParticipantMetadata::default()
        };
        let second = registry
            .upsert_participant(
                &room,
                &participant,
                SessionEvent::Join,
                ParticipantUpdate {
                    connection_id: Some("conn-2".to_string()),
                    metadata: Some(metadata),
                    rtp_capabilities: None,
                },
            )
            .unwrap();
        assert!(!second.inserted);

        let snapshot = registry.snapshot("alice").unwrap();
        assert_eq!(snapshot.connection_id.as_deref(), Some("conn-2"));
        assert_eq!(snapshot.metadata.display_name, "Alice");
        assert_eq!(registry.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_announce_keeps_pending_cleanup_and_join_cancels_it() {
        let registry = Registry::new();
        let locks = LockManager::new();
        join(&registry, &locks, "room-1", "alice").await;
        let room = locks.lock_room("room-1").await;
        let participant = locks.lock_participant_in(&room, "alice").await;
        registry
            .with_participant(&participant, |p| {
                p.state = SessionState::GracePeriod;
                p.liveness.arm(Duration::from_secs(60), |_| async {});
                Ok(())
            })
            .unwrap();

        let announced = registry
            .upsert_participant(
                &room,
                &participant,
                SessionEvent::Announce,
                ParticipantUpdate::default(),
            )
            .unwrap();
        assert_eq!(announced.current, SessionState::GracePeriod);
        assert!(registry.snapshot("alice").unwrap().cleanup_pending);

        registry
            .upsert_participant(&room, &participant, SessionEvent::Join, ParticipantUpdate::default())
            .unwrap();
        let snapshot = registry.snapshot("alice").unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert!(!snapshot.cleanup_pending);
    }

    #[tokio::test]
    async fn test_upsert_rejects_other_room_without_writing() {
        let registry = Registry::new();
        let locks = LockManager::new();
        join(&registry, &locks, "room-1", "alice").await;

        let room = locks.lock_room("room-2").await;
        let participant = locks.lock_participant_in(&room, "alice").await;
        let err = registry
            .upsert_participant(&room, &participant, SessionEvent::Join, ParticipantUpdate::default())
            .unwrap_err();
        assert!(matches!(err, SfuError::Conflict(_)));
        assert!(!registry.has_room("room-2"));
        assert_eq!(registry.room_of("alice").as_deref(), Some("room-1"));
    }

    #[tokio::test]
    async fn test_illegal_first_event_creates_nothing() {
        let registry = Registry::new();
        let locks = LockManager::new();
        let room = locks.lock_room("room-1").await;
        let participant = locks.lock_participant_in(&room, "alice").await;

        let err = registry
            .upsert_participant(
                &room,
                &participant,
                SessionEvent::Reconnect,
                ParticipantUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SfuError::IllegalTransition { .. }));
        assert_eq!(registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_producer_slots_and_index_move_together() {
        let registry = Registry::new();
        let locks = LockManager::new();
        join(&registry, &locks, "room-1", "alice").await;
        let guard = locks.lock_participant("alice").await;

        let replaced = registry
            .with_participant(&guard, |p| {
                p.attach_producer(producer("p1", StreamKind::Audio));
                p.attach_producer(producer("p2", StreamKind::Video));
                Ok(p.attach_producer(producer("p3", StreamKind::Audio)))
            })
            .unwrap();
        assert_eq!(replaced.map(|r| r.id).as_deref(), Some("p1"));
        assert_eq!(registry.index_consistency("room-1"), Some((2, 2)));

        let streams = registry.streams("room-1", None);
        let ids: Vec<&str> = streams.iter().map(|s| s.stream_id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3"]);
        assert!(registry.streams("room-1", Some("alice")).is_empty());

        registry
            .with_participant(&guard, |p| Ok(p.detach_producer(StreamKind::Video)))
            .unwrap();
        assert_eq!(registry.index_consistency("room-1"), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_remove_cleans_index_and_empties_room() {
        let registry = Registry::new();
        let locks = LockManager::new();
        join(&registry, &locks, "room-1", "alice").await;
        join(&registry, &locks, "room-1", "bob").await;
        {
            let guard = locks.lock_participant("alice").await;
            registry
                .with_participant(&guard, |p| {
                    Ok(p.attach_producer(producer("a-audio", StreamKind::Audio)))
                })
                .unwrap();
        }

        let room = locks.lock_room("room-1").await;
        let alice = locks.lock_participant_in(&room, "alice").await;
        let removed = registry.remove_participant(&room, &alice).unwrap();
        assert!(!removed.room_emptied);
        assert_eq!(removed.participant.state, SessionState::Removed);
        assert_eq!(removed.participant.producers().len(), 1);
        assert_eq!(registry.index_consistency("room-1"), Some((0, 0)));
        assert!(registry.room_of("alice").is_none());

        // second removal is a no-op
        assert!(registry.remove_participant(&room, &alice).is_none());
        drop(alice);

        let bob = locks.lock_participant_in(&room, "bob").await;
        let removed = registry.remove_participant(&room, &bob).unwrap();
        assert!(removed.room_emptied);
        assert!(!registry.has_room("room-1"));
        assert_eq!(registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_connections_exclude_sender() {
        let registry = Registry::new();
        let locks = LockManager::new();
        join(&registry, &locks, "room-1", "alice").await;
        join(&registry, &locks, "room-1", "bob").await;

        let others = registry.connections("room-1", Some("alice"));
        assert_eq!(others, vec!["conn-bob".to_string()]);
        assert_eq!(registry.connections("room-1", None).len(), 2);
        assert_eq!(registry.participants("room-1").len(), 2);
    }

    #[tokio::test]
    async fn test_with_participant_missing_is_not_found() {
        let registry = Registry::new();
        let locks = LockManager::new();
        let guard = locks.lock_participant("ghost").await;
        let err = registry.with_participant(&guard, |_| Ok(())).unwrap_err();
        assert_eq!(err.error_code(), 4);
    }

    #[tokio::test]
    async fn test_ensure_room_is_idempotent() {
        let registry = Registry::new();
        let locks = LockManager::new();
        let room = locks.lock_room("room-1").await;
        assert!(registry.ensure_room(&room));
        assert!(!registry.ensure_room(&room));
        assert!(registry.remove_room_if_empty(&room));
        assert!(!registry.has_room("room-1"));
    }
}
