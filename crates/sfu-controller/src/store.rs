//! Persistence of room existence and join/leave timestamps.
//!
//! The store is an external collaborator. Session operations consult
//! [`SessionStore::room_exists`] only for `prepare`; join and leave
//! records are written after the fact and their failures are logged, never
//! propagated.

use crate::errors::SfuError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn room_exists(&self, room_id: &str) -> Result<bool, SfuError>;

    /// Upsert the participant record with a join timestamp.
    async fn record_join(&self, room_id: &str, uid: &str) -> Result<(), SfuError>;

    async fn record_leave(&self, room_id: &str, uid: &str) -> Result<(), SfuError>;
}

/// One participant's persisted attendance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoreState {
    rooms: HashSet<String>,
    attendance: HashMap<(String, String), AttendanceRecord>,
    fail_writes: bool,
}

/// In-process [`SessionStore`].
///
/// Strict by default: only rooms added with [`register_room`](Self::register_room)
/// exist. [`with_open_rooms`](Self::with_open_rooms) treats every room as
/// existing.
#[derive(Default)]
pub struct InMemorySessionStore {
    open_rooms: bool,
    state: Mutex<StoreState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_rooms() -> Self {
        Self {
            open_rooms: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_room(&self, room_id: &str) {
        self.state().rooms.insert(room_id.to_string());
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn attendance(&self, room_id: &str, uid: &str) -> Option<AttendanceRecord> {
        self.state()
            .attendance
            .get(&(room_id.to_string(), uid.to_string()))
            .cloned()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn room_exists(&self, room_id: &str) -> Result<bool, SfuError> {
        Ok(self.open_rooms || self.state().rooms.contains(room_id))
    }

    async fn record_join(&self, room_id: &str, uid: &str) -> Result<(), SfuError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(SfuError::Store("write rejected".to_string()));
        }
        state.attendance.insert(
            (room_id.to_string(), uid.to_string()),
            AttendanceRecord {
                joined_at: Utc::now(),
                left_at: None,
            },
        );
        Ok(())
    }

    async fn record_leave(&self, room_id: &str, uid: &str) -> Result<(), SfuError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(SfuError::Store("write rejected".to_string()));
        }
        let key = (room_id.to_string(), uid.to_string());
        let now = Utc::now();
        state
            .attendance
            .entry(key)
            .and_modify(|r| r.left_at = Some(now))
            .or_insert(AttendanceRecord {
                joined_at: now,
                left_at: Some(now),
            });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_strict_store_knows_registered_rooms_only() {
        let store = InMemorySessionStore::new();
        store.register_room("room-1");
        assert!(store.room_exists("room-1").await.unwrap());
        assert!(!store.room_exists("room-2").await.unwrap());

        let open = InMemorySessionStore::with_open_rooms();
        assert!(open.room_exists("anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_join_then_leave_sets_both_timestamps() {
        let store = InMemorySessionStore::new();
        store.record_join("room-1", "alice").await.unwrap();
        assert!(store.attendance("room-1", "alice").unwrap().left_at.is_none());

        store.record_leave("room-1", "alice").await.unwrap();
        let record = store.attendance("room-1", "alice").unwrap();
        assert!(record.left_at.unwrap() >= record.joined_at);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = InMemorySessionStore::new();
        store.fail_writes(true);
        let err = store.record_join("room-1", "alice").await.unwrap_err();
        assert_eq!(err.error_code(), 6);
        assert!(store.attendance("room-1", "alice").is_none());
    }
}
