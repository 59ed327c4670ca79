//! Worker pool and least-loaded selection.
//!
//! Workers are keyed by a pool-assigned id starting at 1 and kept in id
//! order, so ties in least-loaded selection resolve to the lowest id. The
//! pool is the only owner of router counts; the router directory increments
//! through [`WorkerPool::acquire_least_loaded`] and decrements through
//! [`WorkerPool::release_router`].

use crate::engine::{MediaEngine, WorkerHandle, WorkerResourceUsage, WorkerSettings};
use crate::errors::SfuError;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{info, warn};

pub type WorkerId = u32;

/// Public view of a worker record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub router_count: u32,
    pub memory_usage_mb: u64,
    pub cpu_usage: f64,
}

struct WorkerEntry {
    info: WorkerInfo,
    handle: WorkerHandle,
    last_cpu_sample: Option<(u64, Instant)>,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub total_routers: u32,
    pub average_routers_per_worker: f64,
    pub total_memory_mb: u64,
    /// True when active workers' router counts differ by at most one.
    pub is_balanced: bool,
    /// Router count per worker, in id order.
    pub distribution: Vec<u32>,
    pub workers: Vec<WorkerInfo>,
}

/// Owns the worker records and their load counters.
pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    settings: WorkerSettings,
    max_routers_per_worker: u32,
    next_id: AtomicU32,
    workers: Mutex<BTreeMap<WorkerId, WorkerEntry>>,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        settings: WorkerSettings,
        max_routers_per_worker: u32,
    ) -> Self {
        Self {
            engine,
            settings,
            max_routers_per_worker,
            next_id: AtomicU32::new(1),
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, BTreeMap<WorkerId, WorkerEntry>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_gauges(workers: &BTreeMap<WorkerId, WorkerEntry>) {
        let active = workers.values().filter(|w| w.info.is_active).count();
        metrics::set_workers_active(active as u64);
    }

    /// Spawn `count` workers. Any spawn failure aborts pool creation.
    pub async fn create_pool(&self, count: usize) -> Result<Vec<WorkerId>, SfuError> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.spawn_worker().await?);
        }
        info!(target: "sfu.workers", workers = ids.len(), "Worker pool created");
        Ok(ids)
    }

    /// Spawn one worker and add it to the pool with zero load.
    pub async fn spawn_worker(&self) -> Result<WorkerId, SfuError> {
        let handle = self.engine.create_worker(&self.settings).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = WorkerInfo {
            id,
            pid: handle.pid,
            created_at: Utc::now(),
            is_active: true,
            router_count: 0,
            memory_usage_mb: 0,
            cpu_usage: 0.0,
        };

        let mut workers = self.workers();
        workers.insert(
            id,
            WorkerEntry {
                info,
                handle,
                last_cpu_sample: None,
            },
        );
        Self::publish_gauges(&workers);
        drop(workers);

        info!(target: "sfu.workers", worker_id = id, "Worker spawned");
        Ok(id)
    }

    /// The active, unsaturated worker with the fewest routers.
    pub fn least_loaded(&self) -> Result<WorkerInfo, SfuError> {
        let workers = self.workers();
        self.pick(&workers)
            .and_then(|id| workers.get(&id))
            .map(|w| w.info.clone())
            .ok_or(SfuError::Capacity)
    }

    fn pick(&self, workers: &BTreeMap<WorkerId, WorkerEntry>) -> Option<WorkerId> {
        let mut best: Option<&WorkerEntry> = None;
        for entry in workers.values() {
            if !entry.info.is_active || entry.info.router_count >= self.max_routers_per_worker {
                continue;
            }
            // strict comparison keeps the first minimum in id order
            if best.map_or(true, |b| entry.info.router_count < b.info.router_count) {
                best = Some(entry);
            }
        }
        best.map(|b| b.info.id)
    }

    /// Select the least-loaded worker and count one router against it.
    ///
    /// The caller must pair a failed router creation with
    /// [`release_router`](Self::release_router).
    pub fn acquire_least_loaded(&self) -> Result<(WorkerId, WorkerHandle), SfuError> {
        let mut workers = self.workers();
        let id = self.pick(&workers).ok_or(SfuError::Capacity)?;
        let entry = workers.get_mut(&id).ok_or(SfuError::Capacity)?;
        entry.info.router_count += 1;
        Ok((id, entry.handle.clone()))
    }

    pub fn release_router(&self, worker_id: WorkerId) {
        if let Some(entry) = self.workers().get_mut(&worker_id) {
            entry.info.router_count = entry.info.router_count.saturating_sub(1);
        }
    }

    /// Mark a worker dead. Returns false if it was already inactive or unknown.
    pub fn mark_inactive(&self, worker_id: WorkerId) -> bool {
        let mut workers = self.workers();
        let Some(entry) = workers.get_mut(&worker_id) else {
            return false;
        };
        if !entry.info.is_active {
            return false;
        }
        entry.info.is_active = false;
        entry.info.router_count = 0;
        Self::publish_gauges(&workers);
        true
    }

    /// Store a resource sample and return the updated record.
    ///
    /// CPU usage is the share of wall time spent on CPU since the previous
    /// sample, so the first sample of a worker always reads 0.
    pub fn record_usage(
        &self,
        worker_id: WorkerId,
        usage: WorkerResourceUsage,
        now: Instant,
    ) -> Option<WorkerInfo> {
        let mut workers = self.workers();
        let entry = workers.get_mut(&worker_id)?;
        let cpu_time = usage.cpu_time_ms();
        entry.info.memory_usage_mb = usage.memory_mb();
        entry.info.cpu_usage = match entry.last_cpu_sample {
            Some((prev_cpu, prev_at)) => {
                let wall_ms = now.saturating_duration_since(prev_at).as_millis() as f64;
                if wall_ms > 0.0 {
                    (cpu_time.saturating_sub(prev_cpu) as f64 / wall_ms) * 100.0
                } else {
                    entry.info.cpu_usage
                }
            }
            None => 0.0,
        };
        entry.last_cpu_sample = Some((cpu_time, now));
        Some(entry.info.clone())
    }

    pub fn handle(&self, worker_id: WorkerId) -> Option<WorkerHandle> {
        self.workers().get(&worker_id).map(|w| w.handle.clone())
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<WorkerInfo> {
        self.workers().get(&worker_id).map(|w| w.info.clone())
    }

    /// All worker records in id order.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers().values().map(|w| w.info.clone()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self.snapshot();
        let active: Vec<&WorkerInfo> = workers.iter().filter(|w| w.is_active).collect();
        let total_routers: u32 = workers.iter().map(|w| w.router_count).sum();
        let average_routers_per_worker = if workers.is_empty() {
            0.0
        } else {
            ((f64::from(total_routers) / workers.len() as f64) * 100.0).round() / 100.0
        };
        let max = active.iter().map(|w| w.router_count).max().unwrap_or(0);
        let min = active.iter().map(|w| w.router_count).min().unwrap_or(0);

        PoolStats {
            total: workers.len(),
            active: active.len(),
            inactive: workers.len() - active.len(),
            total_routers,
            average_routers_per_worker,
            total_memory_mb: workers.iter().map(|w| w.memory_usage_mb).sum(),
            is_balanced: max - min <= 1,
            distribution: workers.iter().map(|w| w.router_count).collect(),
            workers,
        }
    }

    /// Close every worker. Used on shutdown after routers have been closed.
    pub async fn close_all(&self) {
        let handles: Vec<(WorkerId, WorkerHandle)> = {
            let mut workers = self.workers();
            let handles = workers
                .iter()
                .filter(|(_, w)| w.info.is_active)
                .map(|(id, w)| (*id, w.handle.clone()))
                .collect();
            for entry in workers.values_mut() {
                entry.info.is_active = false;
            }
            Self::publish_gauges(&workers);
            handles
        };
        for (worker_id, handle) in handles {
            self.engine.close_worker(&handle).await;
            info!(target: "sfu.workers", worker_id, "Worker closed");
        }
    }

    /// Warn if a sample crosses the configured thresholds.
    pub fn check_thresholds(info: &WorkerInfo, memory_warn_mb: u64, cpu_warn_percent: f64) {
        if info.memory_usage_mb > memory_warn_mb {
            warn!(
                target: "sfu.workers",
                worker_id = info.id,
                memory_mb = info.memory_usage_mb,
                threshold_mb = memory_warn_mb,
                "Worker memory above threshold"
            );
        }
        if info.cpu_usage > cpu_warn_percent {
            warn!(
                target: "sfu.workers",
                worker_id = info.id,
                cpu_percent = info.cpu_usage,
                threshold_percent = cpu_warn_percent,
                "Worker CPU above threshold"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::loopback::{EngineOp, LoopbackEngine};
    use std::time::Duration;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            log_level: "warn".to_string(),
        }
    }

    async fn pool_with(count: usize, max_routers: u32) -> (Arc<LoopbackEngine>, WorkerPool) {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = WorkerPool::new(engine.clone(), settings(), max_routers);
        pool.create_pool(count).await.unwrap();
        (engine, pool)
    }

    fn set_counts(pool: &WorkerPool, counts: &[u32]) {
        let mut workers = pool.workers();
        for (entry, count) in workers.values_mut().zip(counts) {
            entry.info.router_count = *count;
        }
    }

    #[tokio::test]
    async fn test_ids_start_at_one() {
        let (_engine, pool) = pool_with(3, 50).await;
        let ids: Vec<WorkerId> = pool.snapshot().iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_least_loaded_picks_minimum_then_rebalances() {
        let (_engine, pool) = pool_with(3, 50).await;
        set_counts(&pool, &[3, 1, 2]);

        let chosen = pool.least_loaded().unwrap();
        assert_eq!(chosen.id, 2);
        assert_eq!(chosen.router_count, 1);

        let (acquired, _handle) = pool.acquire_least_loaded().unwrap();
        assert_eq!(acquired, 2);
        assert_eq!(pool.get(2).unwrap().router_count, 2);

        // workers 2 and 3 now tie at 2; the lower id wins
        assert_eq!(pool.least_loaded().unwrap().id, 2);
        set_counts(&pool, &[3, 3, 2]);
        assert_eq!(pool.least_loaded().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_ties_resolve_to_first_in_id_order() {
        let (_engine, pool) = pool_with(4, 50).await;
        set_counts(&pool, &[2, 0, 0, 1]);
        assert_eq!(pool.least_loaded().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_inactive_worker_is_never_selected() {
        let (_engine, pool) = pool_with(2, 50).await;
        set_counts(&pool, &[5, 0]);
        assert!(pool.mark_inactive(2));
        assert!(!pool.mark_inactive(2));

        assert_eq!(pool.least_loaded().unwrap().id, 1);
        assert!(pool.mark_inactive(1));
        assert!(matches!(pool.least_loaded(), Err(SfuError::Capacity)));
        assert!(matches!(pool.acquire_least_loaded(), Err(SfuError::Capacity)));
    }

    #[tokio::test]
    async fn test_saturated_workers_are_skipped() {
        let (_engine, pool) = pool_with(2, 2).await;
        set_counts(&pool, &[2, 1]);
        assert_eq!(pool.acquire_least_loaded().unwrap().0, 2);
        assert!(matches!(pool.acquire_least_loaded(), Err(SfuError::Capacity)));

        pool.release_router(1);
        assert_eq!(pool.acquire_least_loaded().unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_release_never_underflows() {
        let (_engine, pool) = pool_with(1, 50).await;
        pool.release_router(1);
        assert_eq!(pool.get(1).unwrap().router_count, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_pool_creation() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.fail_next(EngineOp::CreateWorker);
        let pool = WorkerPool::new(engine, settings(), 50);
        assert!(pool.create_pool(2).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_usage_computes_memory_and_cpu_share() {
        let (_engine, pool) = pool_with(1, 50).await;
        let start = Instant::now();

        let first = pool
            .record_usage(
                1,
                WorkerResourceUsage {
                    max_rss_kb: 600 * 1024,
                    user_time_ms: 1_000,
                    system_time_ms: 0,
                },
                start,
            )
            .unwrap();
        assert_eq!(first.memory_usage_mb, 600);
        assert!(first.cpu_usage.abs() < f64::EPSILON);

        let second = pool
            .record_usage(
                1,
                WorkerResourceUsage {
                    max_rss_kb: 600 * 1024,
                    user_time_ms: 4_000,
                    system_time_ms: 2_000,
                },
                start + Duration::from_secs(10),
            )
            .unwrap();
        assert!((second.cpu_usage - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_engine, pool) = pool_with(3, 50).await;
        set_counts(&pool, &[1, 1, 3]);
        pool.mark_inactive(3);

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.inactive, 1);
        assert_eq!(stats.total_routers, 2);
        assert_eq!(stats.distribution, vec![1, 1, 0]);
        assert!(stats.is_balanced);
        assert!((stats.average_routers_per_worker - 0.67).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_all_deactivates_workers() {
        let (engine, pool) = pool_with(2, 50).await;
        pool.close_all().await;
        assert!(pool.snapshot().iter().all(|w| !w.is_active));
        assert!(engine.worker_pids().is_empty());
    }
}
