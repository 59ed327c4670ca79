//! Room to router directory.
//!
//! Each room has at most one router, hosted on the worker that was least
//! loaded when the room's first router was created. Creation and close run
//! under the room lock, so two joiners of a new room observe the same
//! router.

use crate::engine::{MediaEngine, RtpCodecCapability};
use crate::errors::SfuError;
use crate::locks::{LockManager, RoomGuard};
use crate::observability::metrics;
use crate::workers::pool::{WorkerId, WorkerPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// A room's router assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterEntry {
    pub router_id: String,
    pub worker_id: WorkerId,
    pub created_at: DateTime<Utc>,
    pub rtp_capabilities: Value,
}

/// Told about each room whose router was lost with its worker, while the
/// room lock is still held.
#[async_trait]
pub trait RouterLossListener: Send + Sync {
    async fn router_lost(&self, room: &RoomGuard);
}

pub struct RouterDirectory {
    entries: Mutex<HashMap<String, RouterEntry>>,
    engine: Arc<dyn MediaEngine>,
    pool: Arc<WorkerPool>,
    locks: Arc<LockManager>,
    media_codecs: Vec<RtpCodecCapability>,
}

impl RouterDirectory {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        pool: Arc<WorkerPool>,
        locks: Arc<LockManager>,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            engine,
            pool,
            locks,
            media_codecs,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RouterEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_gauge(entries: &HashMap<String, RouterEntry>) {
        metrics::set_routers_active(entries.len() as u64);
    }

    pub fn get(&self, room_id: &str) -> Option<RouterEntry> {
        self.entries().get(room_id).cloned()
    }

    /// The room's router, creating it if absent. Takes the room lock on the
    /// slow path only.
    pub async fn get_or_create(&self, room_id: &str) -> Result<RouterEntry, SfuError> {
        if let Some(entry) = self.get(room_id) {
            return Ok(entry);
        }
        let room = self.locks.lock_room(room_id).await;
        self.get_or_create_locked(&room).await
    }

    /// [`get_or_create`](Self::get_or_create) for a caller already holding
    /// the room lock.
    pub async fn get_or_create_locked(&self, room: &RoomGuard) -> Result<RouterEntry, SfuError> {
        let room_id = room.room_id();
        if let Some(entry) = self.get(room_id) {
            return Ok(entry);
        }

        let (worker_id, worker) = self.pool.acquire_least_loaded()?;
        let router = match self.engine.create_router(&worker, &self.media_codecs).await {
            Ok(router) => router,
            Err(e) => {
                self.pool.release_router(worker_id);
                warn!(target: "sfu.routers", room_id, worker_id, error = %e, "Router creation failed");
                return Err(e.into());
            }
        };

        let entry = RouterEntry {
            router_id: router.id,
            worker_id,
            created_at: Utc::now(),
            rtp_capabilities: router.rtp_capabilities,
        };
        let mut entries = self.entries();
        entries.insert(room_id.to_string(), entry.clone());
        Self::publish_gauge(&entries);
        drop(entries);

        info!(
            target: "sfu.routers",
            room_id,
            worker_id,
            router_id = %entry.router_id,
            "Router created"
        );
        Ok(entry)
    }

    /// Close the room's router and release its worker slot. Returns false if
    /// the room had no router.
    pub async fn close(&self, room: &RoomGuard) -> bool {
        let removed = {
            let mut entries = self.entries();
            let removed = entries.remove(room.room_id());
            Self::publish_gauge(&entries);
            removed
        };
        let Some(entry) = removed else {
            return false;
        };
        self.engine.close_router(&entry.router_id).await;
        self.pool.release_router(entry.worker_id);
        info!(
            target: "sfu.routers",
            room_id = %room.room_id(),
            router_id = %entry.router_id,
            "Router closed"
        );
        true
    }

    /// Drop every entry hosted on a dead worker and notify `listener` for
    /// each evicted room under its room lock. The next access to those rooms
    /// creates a fresh router on a live worker.
    pub async fn evict_worker(
        &self,
        worker_id: WorkerId,
        listener: Option<&dyn RouterLossListener>,
    ) -> Vec<String> {
        let rooms: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, e)| e.worker_id == worker_id)
            .map(|(room_id, _)| room_id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            let room = self.locks.lock_room(&room_id).await;
            let removed = {
                let mut entries = self.entries();
                // re-check: the room may have been closed or recreated meanwhile
                let removed = entries.get(&room_id).is_some_and(|e| e.worker_id == worker_id);
                if removed {
                    entries.remove(&room_id);
                }
                Self::publish_gauge(&entries);
                removed
            };
            if !removed {
                continue;
            }
            if let Some(listener) = listener {
                listener.router_lost(&room).await;
            }
            evicted.push(room_id);
        }

        if !evicted.is_empty() {
            warn!(
                target: "sfu.routers",
                worker_id,
                rooms = evicted.len(),
                "Routers evicted after worker death"
            );
        }
        evicted
    }

    /// Close every router. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<RouterEntry> = {
            let mut entries = self.entries();
            let drained = entries.drain().map(|(_, e)| e).collect();
            Self::publish_gauge(&entries);
            drained
        };
        for entry in drained {
            self.engine.close_router(&entry.router_id).await;
            self.pool.release_router(entry.worker_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::loopback::{EngineOp, LoopbackEngine};
    use crate::engine::{default_media_codecs, WorkerSettings};

    async fn directory(workers: usize) -> (Arc<LoopbackEngine>, Arc<WorkerPool>, Arc<RouterDirectory>) {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = Arc::new(WorkerPool::new(
            engine.clone(),
            WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
                log_level: "warn".to_string(),
            },
            50,
        ));
        pool.create_pool(workers).await.unwrap();
        let routers = Arc::new(RouterDirectory::new(
            engine.clone(),
            Arc::clone(&pool),
            Arc::new(LockManager::new()),
            default_media_codecs(),
        ));
        (engine, pool, routers)
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_router() {
        let (engine, pool, routers) = directory(2).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let routers = Arc::clone(&routers);
            tasks.push(tokio::spawn(async move {
                routers.get_or_create("room-1").await.unwrap().router_id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(engine.router_count(), 1);
        assert_eq!(pool.stats().total_routers, 1);
    }

    #[tokio::test]
    async fn test_rooms_spread_across_workers() {
        let (_engine, pool, routers) = directory(2).await;
        let a = routers.get_or_create("room-a").await.unwrap();
        let b = routers.get_or_create("room-b").await.unwrap();
        assert_ne!(a.worker_id, b.worker_id);
        assert_eq!(pool.stats().distribution, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_failed_creation_releases_worker_slot() {
        let (engine, pool, routers) = directory(1).await;
        engine.fail_next(EngineOp::CreateRouter);
        assert!(routers.get_or_create("room-1").await.is_err());
        assert_eq!(pool.get(1).unwrap().router_count, 0);
        assert!(routers.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_and_is_idempotent() {
        let (engine, pool, routers) = directory(1).await;
        let locks = LockManager::new();
        let entry = routers.get_or_create("room-1").await.unwrap();

        let room = locks.lock_room("room-1").await;
        assert!(routers.close(&room).await);
        assert!(!routers.close(&room).await);
        assert_eq!(engine.close_calls(&entry.router_id), 1);
        assert_eq!(pool.get(1).unwrap().router_count, 0);
    }

    #[tokio::test]
    async fn test_evict_worker_only_touches_its_rooms() {
        let (_engine, _pool, routers) = directory(2).await;
        let a = routers.get_or_create("room-a").await.unwrap();
        routers.get_or_create("room-b").await.unwrap();

        let evicted = routers.evict_worker(a.worker_id, None).await;
        assert_eq!(evicted, vec!["room-a".to_string()]);
        assert!(routers.get("room-a").is_none());
        assert!(routers.get("room-b").is_some());
    }

    #[derive(Default)]
    struct RecordingListener {
        rooms: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RouterLossListener for RecordingListener {
        async fn router_lost(&self, room: &RoomGuard) {
            self.rooms.lock().unwrap().push(room.room_id().to_string());
        }
    }

    #[tokio::test]
    async fn test_evict_worker_notifies_listener_per_room() {
        let (_engine, _pool, routers) = directory(1).await;
        let a = routers.get_or_create("room-a").await.unwrap();
        routers.get_or_create("room-b").await.unwrap();

        let listener = RecordingListener::default();
        routers.evict_worker(a.worker_id, Some(&listener)).await;

        let mut rooms = listener.rooms.lock().unwrap().clone();
        rooms.sort();
        assert_eq!(rooms, vec!["room-a".to_string(), "room-b".to_string()]);
        assert!(routers.is_empty());
    }
}
