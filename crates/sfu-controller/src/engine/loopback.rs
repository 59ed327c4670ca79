//! In-process media engine.
//!
//! `LoopbackEngine` keeps engine objects in memory and forwards nothing. It
//! mirrors the object model of a real engine closely enough to drive the
//! controller end to end: closing a router cascades to its transports,
//! closing a transport cascades to its producers and consumers, and killing
//! a worker fires its `died` token.
//!
//! Failures can be injected per operation with [`LoopbackEngine::fail_next`],
//! and every explicit close call is counted per object id so callers can
//! assert that resources were released exactly once.

use super::{
    ConsumerParams, EngineError, MediaEngine, MediaKind, RouterHandle, RtpCodecCapability,
    TransportOptions, TransportParams, WorkerHandle, WorkerResourceUsage, WorkerSettings,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// First pid handed out to loopback workers.
const FIRST_PID: u32 = 10_000;

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateWorker,
    CreateRouter,
    CreateTransport,
    ConnectTransport,
    Produce,
    PauseProducer,
    ResumeProducer,
    Consume,
    PauseConsumer,
    ResumeConsumer,
}

struct LoopWorker {
    handle: WorkerHandle,
    settings: WorkerSettings,
    next_port: u16,
    usage: WorkerResourceUsage,
}

struct LoopRouter {
    worker_pid: u32,
    rtp_capabilities: Value,
}

struct LoopTransport {
    router_id: String,
    connected: bool,
}

struct LoopProducer {
    transport_id: String,
    kind: MediaKind,
    paused: bool,
}

struct LoopConsumer {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

#[derive(Default)]
struct LoopbackState {
    workers: HashMap<u32, LoopWorker>,
    routers: HashMap<String, LoopRouter>,
    transports: HashMap<String, LoopTransport>,
    producers: HashMap<String, LoopProducer>,
    consumers: HashMap<String, LoopConsumer>,
    failures: HashMap<EngineOp, u32>,
    close_calls: HashMap<String, u32>,
}

impl LoopbackState {
    fn take_failure(&mut self, op: EngineOp) -> Result<(), EngineError> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(EngineError::Rejected(format!("injected failure for {op:?}")))
            }
            _ => Ok(()),
        }
    }

    fn count_close(&mut self, id: &str) {
        *self.close_calls.entry(id.to_string()).or_insert(0) += 1;
    }

    fn router_of_transport(&self, transport_id: &str) -> Option<&str> {
        self.transports
            .get(transport_id)
            .map(|t| t.router_id.as_str())
    }

    fn drop_transport(&mut self, transport_id: &str) {
        self.transports.remove(transport_id);
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.drop_producer(&producer_id);
        }
        self.consumers.retain(|_, c| c.transport_id != transport_id);
    }

    /// Consumers die with the producer they forward.
    fn drop_producer(&mut self, producer_id: &str) {
        self.producers.remove(producer_id);
        self.consumers.retain(|_, c| c.producer_id != producer_id);
    }

    fn drop_router(&mut self, router_id: &str) {
        self.routers.remove(router_id);
        let doomed: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in doomed {
            self.drop_transport(&transport_id);
        }
    }

    fn drop_worker(&mut self, pid: u32) -> Option<LoopWorker> {
        let worker = self.workers.remove(&pid)?;
        let doomed: Vec<String> = self
            .routers
            .iter()
            .filter(|(_, r)| r.worker_pid == pid)
            .map(|(id, _)| id.clone())
            .collect();
        for router_id in doomed {
            self.drop_router(&router_id);
        }
        Some(worker)
    }
}

/// In-process [`MediaEngine`].
pub struct LoopbackEngine {
    next_pid: AtomicU32,
    latency: Duration,
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(FIRST_PID),
            latency: Duration::ZERO,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Every call suspends for `latency` before touching state, which makes
    /// interleavings across suspension points observable.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Make the next `op` call fail.
    pub fn fail_next(&self, op: EngineOp) {
        *self.state().failures.entry(op).or_insert(0) += 1;
    }

    /// Simulate an unexpected worker exit: all its routers vanish and its
    /// `died` token fires.
    pub fn kill_worker(&self, pid: u32) -> bool {
        let worker = self.state().drop_worker(pid);
        match worker {
            Some(worker) => {
                debug!(target: "sfu.engine.loopback", pid, "Killing loopback worker");
                worker.handle.died.cancel();
                true
            }
            None => false,
        }
    }

    /// Override the resource usage reported for a worker.
    pub fn set_worker_usage(&self, pid: u32, usage: WorkerResourceUsage) {
        if let Some(worker) = self.state().workers.get_mut(&pid) {
            worker.usage = usage;
        }
    }

    /// Number of explicit close calls received for an object id.
    pub fn close_calls(&self, id: &str) -> u32 {
        self.state().close_calls.get(id).copied().unwrap_or(0)
    }

    pub fn producer_paused(&self, producer_id: &str) -> Option<bool> {
        self.state().producers.get(producer_id).map(|p| p.paused)
    }

    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state().consumers.get(consumer_id).map(|c| c.paused)
    }

    pub fn transport_connected(&self, transport_id: &str) -> Option<bool> {
        self.state().transports.get(transport_id).map(|t| t.connected)
    }

    pub fn router_count(&self) -> usize {
        self.state().routers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.state().producers.len()
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state().workers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerHandle, EngineError> {
        self.delay().await;
        let mut state = self.state();
        state
            .take_failure(EngineOp::CreateWorker)
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let handle = WorkerHandle {
            pid,
            died: CancellationToken::new(),
        };
        state.workers.insert(
            pid,
            LoopWorker {
                handle: handle.clone(),
                settings: settings.clone(),
                next_port: settings.rtc_min_port,
                usage: WorkerResourceUsage::default(),
            },
        );
        Ok(handle)
    }

    async fn worker_resource_usage(
        &self,
        worker: &WorkerHandle,
    ) -> Result<WorkerResourceUsage, EngineError> {
        self.state()
            .workers
            .get(&worker.pid)
            .map(|w| w.usage)
            .ok_or(EngineError::WorkerClosed)
    }

    async fn close_worker(&self, worker: &WorkerHandle) {
        let mut state = self.state();
        state.count_close(&worker.pid.to_string());
        state.drop_worker(worker.pid);
    }

    async fn create_router(
        &self,
        worker: &WorkerHandle,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::CreateRouter)?;
        if !state.workers.contains_key(&worker.pid) {
            return Err(EngineError::WorkerClosed);
        }

        let id = Uuid::new_v4().to_string();
        let rtp_capabilities = json!({ "codecs": media_codecs, "headerExtensions": [] });
        state.routers.insert(
            id.clone(),
            LoopRouter {
                worker_pid: worker.pid,
                rtp_capabilities: rtp_capabilities.clone(),
            },
        );
        Ok(RouterHandle {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &str) {
        let mut state = self.state();
        state.count_close(router_id);
        state.drop_router(router_id);
    }

    async fn create_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::CreateTransport)?;

        let worker_pid = state
            .routers
            .get(router_id)
            .map(|r| r.worker_pid)
            .ok_or_else(|| EngineError::Unknown {
                kind: "router",
                id: router_id.to_string(),
            })?;
        let worker = state
            .workers
            .get_mut(&worker_pid)
            .ok_or(EngineError::WorkerClosed)?;
        let port = worker.next_port;
        worker.next_port = if port >= worker.settings.rtc_max_port {
            worker.settings.rtc_min_port
        } else {
            port + 1
        };

        let id = Uuid::new_v4().to_string();
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let udp_priority: u32 = if options.prefer_udp {
            1_076_302_079
        } else {
            1_076_276_478
        };
        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate", "ip": ip, "port": port,
                "protocol": "udp", "priority": udp_priority, "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate", "ip": ip, "port": port,
                "protocol": "tcp", "priority": 1_076_276_479u32, "type": "host", "tcpType": "passive",
            }));
        }

        state.transports.insert(
            id.clone(),
            LoopTransport {
                router_id: router_id.to_string(),
                connected: false,
            },
        );
        Ok(TransportParams {
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": id.replace('-', ":") }],
            }),
            id,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::ConnectTransport)?;
        if dtls_parameters.get("fingerprints").is_none() {
            return Err(EngineError::Rejected(
                "dtlsParameters without fingerprints".to_string(),
            ));
        }
        let transport =
            state
                .transports
                .get_mut(transport_id)
                .ok_or_else(|| EngineError::Unknown {
                    kind: "transport",
                    id: transport_id.to_string(),
                })?;
        if transport.connected {
            return Err(EngineError::Rejected("transport already connected".to_string()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) {
        let mut state = self.state();
        state.count_close(transport_id);
        state.drop_transport(transport_id);
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<String, EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::Produce)?;
        if !state.transports.contains_key(transport_id) {
            return Err(EngineError::Unknown {
                kind: "transport",
                id: transport_id.to_string(),
            });
        }
        if !rtp_parameters.is_object() {
            return Err(EngineError::Rejected(format!(
                "invalid rtpParameters for {} producer",
                kind.as_str()
            )));
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            LoopProducer {
                transport_id: transport_id.to_string(),
                kind,
                paused: false,
            },
        );
        Ok(id)
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::PauseProducer)?;
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::Unknown {
                kind: "producer",
                id: producer_id.to_string(),
            })?;
        producer.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::ResumeProducer)?;
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::Unknown {
                kind: "producer",
                id: producer_id.to_string(),
            })?;
        producer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) {
        let mut state = self.state();
        state.count_close(producer_id);
        state.drop_producer(producer_id);
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerParams, EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::Consume)?;

        let consumer_router = state
            .router_of_transport(transport_id)
            .ok_or_else(|| EngineError::Unknown {
                kind: "transport",
                id: transport_id.to_string(),
            })?
            .to_string();
        let (producer_transport, kind) = state
            .producers
            .get(producer_id)
            .map(|p| (p.transport_id.clone(), p.kind))
            .ok_or_else(|| EngineError::Unknown {
                kind: "producer",
                id: producer_id.to_string(),
            })?;
        if state.router_of_transport(&producer_transport) != Some(consumer_router.as_str()) {
            return Err(EngineError::Rejected(
                "producer is not routable from this transport".to_string(),
            ));
        }
        let can_consume = rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs
                    .iter()
                    .any(|c| c.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
            });
        if !can_consume {
            return Err(EngineError::Rejected("cannot consume".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(
            id.clone(),
            LoopConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: false,
            },
        );
        let router_codecs = state
            .routers
            .get(&consumer_router)
            .and_then(|r| r.rtp_capabilities.get("codecs").cloned())
            .unwrap_or(Value::Null);
        Ok(ConsumerParams {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: json!({ "codecs": router_codecs, "encodings": [] }),
        })
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::PauseConsumer)?;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::Unknown {
                kind: "consumer",
                id: consumer_id.to_string(),
            })?;
        consumer.paused = true;
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.delay().await;
        let mut state = self.state();
        state.take_failure(EngineOp::ResumeConsumer)?;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::Unknown {
                kind: "consumer",
                id: consumer_id.to_string(),
            })?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) {
        let mut state = self.state();
        state.count_close(consumer_id);
        state.consumers.remove(consumer_id);
    }
}
