//! Per-worker watch tasks.
//!
//! One task per worker samples resource usage on a fixed interval and
//! waits for the engine's `died` signal. On death the worker is marked
//! inactive and its routers are evicted from the directory; the eviction
//! listener releases the media state that died with them. What happens
//! next depends on [`WorkerRecovery`]: a replacement is spawned after a
//! backoff, or the fatal token is cancelled and the process shuts down.

use crate::config::WorkerRecovery;
use crate::engine::{MediaEngine, WorkerHandle};
use crate::observability::metrics;
use crate::routers::{RouterDirectory, RouterLossListener};
use crate::workers::pool::{WorkerId, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervision settings, taken from [`Config`](crate::config::Config).
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub recovery: WorkerRecovery,
    pub respawn_backoff: Duration,
    pub sample_interval: Duration,
    pub memory_warn_mb: u64,
    pub cpu_warn_percent: f64,
}

pub struct WorkerSupervisor {
    engine: Arc<dyn MediaEngine>,
    pool: Arc<WorkerPool>,
    routers: Arc<RouterDirectory>,
    listener: Option<Arc<dyn RouterLossListener>>,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
    fatal: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        pool: Arc<WorkerPool>,
        routers: Arc<RouterDirectory>,
        listener: Option<Arc<dyn RouterLossListener>>,
        settings: SupervisorSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            pool,
            routers,
            listener,
            settings,
            shutdown,
            fatal: CancellationToken::new(),
        })
    }

    /// Cancelled when a worker dies outside recovery mode.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start watching every worker currently in the pool.
    pub fn watch_all(self: &Arc<Self>) {
        for worker in self.pool.snapshot() {
            if worker.is_active {
                self.watch(worker.id);
            }
        }
    }

    /// Spawn the watch task for one worker.
    pub fn watch(self: &Arc<Self>, worker_id: WorkerId) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(worker_id).await })
    }

    async fn run(self: Arc<Self>, worker_id: WorkerId) {
        let Some(handle) = self.pool.handle(worker_id) else {
            return;
        };
        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        debug!(target: "sfu.workers", worker_id, pid = handle.pid, "Watching worker");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!(target: "sfu.workers", worker_id, "Worker watch stopped");
                    return;
                }
                () = handle.died.cancelled() => break,
                _ = ticker.tick() => self.sample(worker_id, &handle).await,
            }
        }

        self.on_death(worker_id, handle.pid).await;
    }

    async fn sample(&self, worker_id: WorkerId, handle: &WorkerHandle) {
        match self.engine.worker_resource_usage(handle).await {
            Ok(usage) => {
                if let Some(info) = self.pool.record_usage(worker_id, usage, Instant::now()) {
                    metrics::set_worker_memory_mb(worker_id, info.memory_usage_mb);
                    WorkerPool::check_thresholds(
                        &info,
                        self.settings.memory_warn_mb,
                        self.settings.cpu_warn_percent,
                    );
                }
            }
            Err(e) => {
                warn!(target: "sfu.workers", worker_id, error = %e, "Worker usage sample failed");
            }
        }
    }

    async fn on_death(self: Arc<Self>, worker_id: WorkerId, pid: u32) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.pool.mark_inactive(worker_id) {
            return;
        }
        let evicted = self
            .routers
            .evict_worker(worker_id, self.listener.as_deref())
            .await;
        error!(
            target: "sfu.workers",
            worker_id,
            pid,
            rooms_affected = evicted.len(),
            recovery = ?self.settings.recovery,
            "Media worker died"
        );

        match self.settings.recovery {
            WorkerRecovery::Fatal => {
                metrics::record_worker_death("fatal");
                self.fatal.cancel();
            }
            WorkerRecovery::Respawn => {
                metrics::record_worker_death("respawn");
                tokio::select! {
                    () = self.shutdown.cancelled() => return,
                    () = tokio::time::sleep(self.settings.respawn_backoff) => {}
                }
                match self.pool.spawn_worker().await {
                    Ok(replacement) => {
                        info!(
                            target: "sfu.workers",
                            worker_id = replacement,
                            replaced = worker_id,
                            "Replacement worker spawned"
                        );
                        self.watch(replacement);
                    }
                    Err(e) => {
                        error!(
                            target: "sfu.workers",
                            replaced = worker_id,
                            error = %e,
                            "Replacement worker spawn failed"
                        );
                        self.fatal.cancel();
                    }
                }
            }
        }
    }
}
