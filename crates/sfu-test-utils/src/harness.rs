//! In-process controller harness.
//!
//! [`TestHarness`] runs a full [`SfuController`] on the loopback engine and
//! an in-memory session store. [`TestClient`] stands in for a signaling
//! connection: requests go straight to the session handler and broadcasts
//! arrive on the client's outbound queue.

use crate::fixtures::{dtls_parameters, rtp_capabilities, rtp_parameters, TestParticipant};
use sfu_controller::config::{Config, WorkerRecovery};
use sfu_controller::controller::SfuController;
use sfu_controller::engine::loopback::LoopbackEngine;
use sfu_controller::engine::{ConsumerParams, TransportDirection, TransportParams};
use sfu_controller::errors::SfuError;
use sfu_controller::registry::{ParticipantSnapshot, PendingConsumer, StreamInfo, StreamKind};
use sfu_controller::session::messages::{ClientEvent, ServerEvent};
use sfu_controller::session::{ConnectionContext, SessionHandler};
use sfu_controller::store::InMemorySessionStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long [`TestClient::recv`] waits for an event.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarnessBuilder {
    config: Config,
    strict_store: bool,
    engine_latency: Duration,
}

impl TestHarnessBuilder {
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.config.num_workers = count;
        self
    }

    #[must_use]
    pub fn recovery(mut self, recovery: WorkerRecovery) -> Self {
        self.config.worker_recovery = recovery;
        self
    }

    #[must_use]
    pub fn respawn_backoff(mut self, backoff: Duration) -> Self {
        self.config.worker_respawn_backoff = backoff;
        self
    }

    #[must_use]
    pub fn heartbeat_grace(mut self, grace: Duration) -> Self {
        self.config.heartbeat_grace = grace;
        self
    }

    #[must_use]
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    #[must_use]
    pub fn max_routers_per_worker(mut self, max: u32) -> Self {
        self.config.max_routers_per_worker = max;
        self
    }

    /// Delay every engine call, so concurrent requests interleave at each
    /// suspension point.
    #[must_use]
    pub fn engine_latency(mut self, latency: Duration) -> Self {
        self.engine_latency = latency;
        self
    }

    /// Only rooms registered with the store exist for `prepare`.
    #[must_use]
    pub fn strict_store(mut self) -> Self {
        self.strict_store = true;
        self
    }

    pub async fn build(self) -> TestHarness {
        let engine = Arc::new(LoopbackEngine::new().with_latency(self.engine_latency));
        let store = Arc::new(if self.strict_store {
            InMemorySessionStore::new()
        } else {
            InMemorySessionStore::with_open_rooms()
        });
        let shutdown = CancellationToken::new();
        let controller = SfuController::start(
            &self.config,
            engine.clone(),
            store.clone(),
            shutdown.clone(),
        )
        .await
        .expect("controller should start");

        TestHarness {
            engine,
            store,
            controller,
            shutdown,
        }
    }
}

pub struct TestHarness {
    pub engine: Arc<LoopbackEngine>,
    pub store: Arc<InMemorySessionStore>,
    pub controller: SfuController,
    pub shutdown: CancellationToken,
}

impl TestHarness {
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        let mut config = Config::from_vars(&HashMap::new()).expect("default config is valid");
        config.num_workers = 2;
        TestHarnessBuilder {
            config,
            strict_store: false,
            engine_latency: Duration::ZERO,
        }
    }

    /// Harness with two workers and default grace windows.
    pub async fn start() -> Self {
        Self::builder().build().await
    }

    pub fn handler(&self) -> Arc<SessionHandler> {
        Arc::clone(self.controller.handler())
    }

    /// Open a new connection for `uid`.
    pub fn connect(&self, uid: &str) -> TestClient {
        let ctx = ConnectionContext::new(Uuid::new_v4().to_string(), uid);
        let (tx, rx) = mpsc::channel(64);
        self.controller.handler().hub().register(&ctx.connection_id, tx);
        TestClient {
            participant: TestParticipant::new(uid),
            ctx,
            handler: self.handler(),
            rx,
        }
    }

    pub fn snapshot(&self, uid: &str) -> Option<ParticipantSnapshot> {
        self.controller.registry().snapshot(uid)
    }

    /// Connect `uid`, announce capabilities and join `room_id`.
    pub async fn joined(&self, uid: &str, room_id: &str) -> TestClient {
        let mut client = self.connect(uid);
        client.announce(room_id).await;
        client.join(room_id).await;
        client
    }

    /// [`joined`](Self::joined) plus both transports created and connected.
    pub async fn ready(&self, uid: &str, room_id: &str) -> TestClient {
        let mut client = self.joined(uid, room_id).await;
        client.create_transport(TransportDirection::Send).await;
        client.connect_transport(TransportDirection::Send).await;
        client.create_transport(TransportDirection::Recv).await;
        client.connect_transport(TransportDirection::Recv).await;
        client
    }
}

pub struct TestClient {
    pub participant: TestParticipant,
    pub ctx: ConnectionContext,
    handler: Arc<SessionHandler>,
    rx: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    /// Handle one request and return its reply.
    pub async fn request(&self, event: ClientEvent) -> Result<Option<ServerEvent>, SfuError> {
        self.handler.handle(&self.ctx, event).await
    }

    /// Handle one request through the dispatch path; the reply, or the
    /// `error` event, arrives on this client's queue.
    pub async fn dispatch(&self, event: ClientEvent) {
        self.handler.dispatch(&self.ctx, event).await;
    }

    /// Next queued event.
    pub async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection queue closed")
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }

    /// All currently queued events.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Simulate the socket dropping.
    pub async fn disconnect(&self) {
        self.handler.hub().unregister(&self.ctx.connection_id);
        self.handler.disconnect(&self.ctx).await;
    }

    pub async fn announce(&mut self, room_id: &str) -> ServerEvent {
        self.request(ClientEvent::AnnounceCapabilities {
            room_id: room_id.to_string(),
            rtp_capabilities: rtp_capabilities(),
        })
        .await
        .expect("announce-capabilities should succeed")
        .expect("announce-capabilities replies")
    }

    pub async fn join(&mut self, room_id: &str) -> ServerEvent {
        self.request(ClientEvent::Join {
            room_id: room_id.to_string(),
            metadata: self.participant.metadata.clone(),
        })
        .await
        .expect("join should succeed")
        .expect("join replies")
    }

    pub async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> (TransportParams, Vec<PendingConsumer>) {
        match self
            .request(ClientEvent::CreateTransport { direction })
            .await
            .expect("create-transport should succeed")
        {
            Some(ServerEvent::TransportCreated {
                params,
                pending_consumers,
                ..
            }) => (params, pending_consumers),
            other => panic!("unexpected create-transport reply: {other:?}"),
        }
    }

    pub async fn connect_transport(&mut self, direction: TransportDirection) -> Vec<StreamInfo> {
        match self
            .request(ClientEvent::ConnectTransport {
                direction,
                dtls_parameters: dtls_parameters(),
            })
            .await
            .expect("connect-transport should succeed")
        {
            Some(ServerEvent::TransportConnected { streams, .. }) => streams,
            other => panic!("unexpected connect-transport reply: {other:?}"),
        }
    }

    /// Publish a stream and return its id.
    pub async fn produce(&mut self, kind: StreamKind) -> String {
        match self
            .request(ClientEvent::Produce {
                kind,
                rtp_parameters: rtp_parameters(kind),
            })
            .await
            .expect("produce should succeed")
        {
            Some(ServerEvent::Produced { stream_id, .. }) => stream_id,
            other => panic!("unexpected produce reply: {other:?}"),
        }
    }

    pub async fn consume(&mut self, stream_id: &str) -> Result<ServerEvent, SfuError> {
        self.request(ClientEvent::Consume {
            stream_id: stream_id.to_string(),
        })
        .await
        .map(|reply| reply.expect("consume replies"))
    }

    /// Consume a stream that must be consumable right away.
    pub async fn consume_now(&mut self, stream_id: &str) -> ConsumerParams {
        match self.consume(stream_id).await.expect("consume should succeed") {
            ServerEvent::ConsumerCreated { consumer, .. } => consumer,
            other => panic!("unexpected consume reply: {other:?}"),
        }
    }

    pub async fn leave(&mut self) -> Result<Option<ServerEvent>, SfuError> {
        self.request(ClientEvent::Leave).await
    }

    pub async fn heartbeat(&mut self) -> Result<Option<ServerEvent>, SfuError> {
        self.request(ClientEvent::Heartbeat).await
    }

    /// Reconnect on a fresh connection for the same uid.
    pub async fn reconnect(
        &self,
        harness: &TestHarness,
        room_id: &str,
    ) -> (TestClient, Result<Option<ServerEvent>, SfuError>) {
        let client = harness.connect(&self.ctx.uid);
        let reply = client
            .request(ClientEvent::Reconnect {
                room_id: room_id.to_string(),
                metadata: None,
            })
            .await;
        (client, reply)
    }
}
