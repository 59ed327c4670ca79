//! Process-wide wiring of the SFU control plane.
//!
//! [`SfuController::start`] creates the worker pool, starts the lock
//! sweeper, builds the session handler, and starts worker supervision with
//! the handler as its router-loss listener. Every long-lived
//! task hangs off one shutdown token.

use crate::config::Config;
use crate::engine::{default_media_codecs, MediaEngine, TransportOptions, WorkerSettings};
use crate::errors::SfuError;
use crate::locks::LockManager;
use crate::observability::StatsSources;
use crate::registry::Registry;
use crate::routers::{RouterDirectory, RouterLossListener};
use crate::session::hub::ConnectionHub;
use crate::session::{SessionHandler, SessionSettings};
use crate::signaling::signaling_router;
use crate::store::SessionStore;
use crate::workers::{SupervisorSettings, WorkerPool, WorkerSupervisor};
use axum::Router;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct SfuController {
    engine: Arc<dyn MediaEngine>,
    pool: Arc<WorkerPool>,
    routers: Arc<RouterDirectory>,
    registry: Arc<Registry>,
    locks: Arc<LockManager>,
    handler: Arc<SessionHandler>,
    supervisor: Arc<WorkerSupervisor>,
    sweeper: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl SfuController {
    /// Spawn `config.num_workers` workers and start every background task.
    ///
    /// Fails if any worker cannot be spawned; workers already created are
    /// closed again.
    pub async fn start(
        config: &Config,
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn SessionStore>,
        shutdown: CancellationToken,
    ) -> Result<Self, SfuError> {
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&engine),
            WorkerSettings {
                rtc_min_port: config.rtc_min_port,
                rtc_max_port: config.rtc_max_port,
                log_level: config.worker_log_level.clone(),
            },
            config.max_routers_per_worker,
        ));
        if let Err(e) = pool.create_pool(config.num_workers).await {
            pool.close_all().await;
            return Err(e);
        }

        let locks = Arc::new(LockManager::new());
        let registry = Arc::new(Registry::new());
        let routers = Arc::new(RouterDirectory::new(
            Arc::clone(&engine),
            Arc::clone(&pool),
            Arc::clone(&locks),
            default_media_codecs(),
        ));

        let sweeper = Arc::clone(&locks).spawn_sweeper(
            Arc::clone(&registry),
            config.lock_sweep_interval,
            shutdown.child_token(),
        );

        let handler = SessionHandler::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            Arc::clone(&routers),
            Arc::clone(&locks),
            Arc::new(ConnectionHub::new()),
            store,
            SessionSettings {
                heartbeat_grace: config.heartbeat_grace,
                disconnect_grace: config.disconnect_grace,
                transport_options: TransportOptions {
                    announced_ip: config.announced_ip.clone(),
                    ..TransportOptions::default()
                },
            },
        );

        let supervisor = WorkerSupervisor::new(
            Arc::clone(&engine),
            Arc::clone(&pool),
            Arc::clone(&routers),
            Some(Arc::clone(&handler) as Arc<dyn RouterLossListener>),
            SupervisorSettings {
                recovery: config.worker_recovery,
                respawn_backoff: config.worker_respawn_backoff,
                sample_interval: config.worker_sample_interval,
                memory_warn_mb: config.worker_memory_warn_mb,
                cpu_warn_percent: config.worker_cpu_warn_percent,
            },
            shutdown.child_token(),
        );
        supervisor.watch_all();

        info!(
            target: "sfu.controller",
            workers = config.num_workers,
            recovery = ?config.worker_recovery,
            "SFU controller started"
        );

        Ok(Self {
            engine,
            pool,
            routers,
            registry,
            locks,
            handler,
            supervisor,
            sweeper,
            shutdown,
        })
    }

    pub fn handler(&self) -> &Arc<SessionHandler> {
        &self.handler
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn routers(&self) -> &Arc<RouterDirectory> {
        &self.routers
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Cancelled when a worker death is fatal to the process.
    pub fn fatal_token(&self) -> CancellationToken {
        self.supervisor.fatal_token()
    }

    /// Router serving `/ws`. Open connections close on shutdown.
    pub fn signaling_router(&self) -> Router {
        signaling_router(Arc::clone(&self.handler), self.shutdown.child_token())
    }

    pub fn stats_sources(&self) -> StatsSources {
        StatsSources {
            pool: Arc::clone(&self.pool),
            registry: Arc::clone(&self.registry),
            routers: Arc::clone(&self.routers),
        }
    }

    /// Stop background tasks, then close every router and worker.
    pub async fn shutdown(self) {
        info!(target: "sfu.controller", "SFU controller shutting down");
        self.shutdown.cancel();
        let _ = self.sweeper.await;
        self.routers.close_all().await;
        self.pool.close_all().await;
        info!(target: "sfu.controller", "SFU controller stopped");
    }
}
