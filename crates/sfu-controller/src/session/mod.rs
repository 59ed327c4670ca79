//! Session protocol handler.
//!
//! Translates client events into state transitions and media engine calls.
//! Every mutation runs under the lock of the key it touches:
//!
//! | Operation | Locks |
//! |---|---|
//! | join, leave, leave-prepare, cleanup timer expiry, router loss | room, then participant |
//! | announce-capabilities | room, then participant |
//! | everything else | participant |
//!
//! `create-transport` and `consume` may need a router first; they resolve it
//! through [`RouterDirectory::get_or_create`] before taking the participant
//! lock, so no participant lock is ever held while a room lock is requested.
//!
//! Engine calls run inside the critical section and registry state is only
//! written after they succeed.

pub mod hub;
pub mod liveness;
pub mod messages;
pub mod state;

use async_trait::async_trait;
use crate::engine::{MediaEngine, TransportDirection, TransportOptions};
use crate::errors::SfuError;
use crate::locks::{LockManager, ParticipantGuard, RoomGuard};
use crate::observability::metrics;
use crate::registry::{
    ConsumerRecord, Participant, ParticipantMetadata, ParticipantMut, ParticipantUpdate,
    PendingConsumer, ProducerRecord, Registry, StreamInfo, StreamKind, TransportRecord,
};
use crate::routers::{RouterDirectory, RouterLossListener};
use crate::store::SessionStore;
use hub::ConnectionHub;
use messages::{ClientEvent, ServerEvent};
use serde_json::Value;
use state::SessionEvent;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Identity of the connection an event arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub uid: String,
}

impl ConnectionContext {
    pub fn new(connection_id: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            uid: uid.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Silence after the last heartbeat before the participant is removed.
    pub heartbeat_grace: Duration,
    /// Grace period before a disconnected participant is removed.
    pub disconnect_grace: Duration,
    pub transport_options: TransportOptions,
}

/// Why a participant left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Leave,
    LeavePrepare,
    GraceExpired,
    HeartbeatTimeout,
}

impl RemovalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RemovalReason::Leave => "leave",
            RemovalReason::LeavePrepare => "leave_prepare",
            RemovalReason::GraceExpired => "grace_expired",
            RemovalReason::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

enum ConsumePlan {
    Queued,
    Ready {
        transport_id: String,
        from_uid: String,
        kind: StreamKind,
        rtp_capabilities: Value,
    },
}

fn require_active(participant: &Participant) -> Result<(), SfuError> {
    participant.state.apply(SessionEvent::Media).map(|_| ())
}

fn validate_rtp_capabilities(rtp_capabilities: &Value) -> Result<(), SfuError> {
    match rtp_capabilities.get("codecs").and_then(Value::as_array) {
        Some(_) => Ok(()),
        None => Err(SfuError::InvalidInput(
            "Invalid RTP capabilities".to_string(),
        )),
    }
}

pub struct SessionHandler {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<Registry>,
    routers: Arc<RouterDirectory>,
    locks: Arc<LockManager>,
    hub: Arc<ConnectionHub>,
    store: Arc<dyn SessionStore>,
    settings: SessionSettings,
    this: Weak<SessionHandler>,
}

impl SessionHandler {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<Registry>,
        routers: Arc<RouterDirectory>,
        locks: Arc<LockManager>,
        hub: Arc<ConnectionHub>,
        store: Arc<dyn SessionStore>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            registry,
            routers,
            locks,
            hub,
            store,
            settings,
            this: this.clone(),
        })
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn room_of(&self, uid: &str) -> Result<String, SfuError> {
        self.registry
            .room_of(uid)
            .ok_or_else(|| SfuError::not_found("Participant", uid))
    }

    fn broadcast_to_others(&self, room_id: &str, uid: &str, event: &ServerEvent) {
        let connections = self.registry.connections(room_id, Some(uid));
        self.hub.broadcast(&connections, event);
    }

    fn broadcast_to_room(&self, room_id: &str, event: &ServerEvent) {
        let connections = self.registry.connections(room_id, None);
        self.hub.broadcast(&connections, event);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Handle one event and send the reply, or an `error` event, back to
    /// the originating connection.
    pub async fn dispatch(&self, ctx: &ConnectionContext, event: ClientEvent) {
        let name = event.name();
        let started = Instant::now();
        let result = self.handle(ctx, event).await;
        let elapsed = started.elapsed();

        match result {
            Ok(reply) => {
                metrics::record_event(name, "ok", elapsed);
                if let Some(reply) = reply {
                    self.hub.send(&ctx.connection_id, reply);
                }
            }
            Err(e) => {
                metrics::record_event(name, "error", elapsed);
                match &e {
                    SfuError::Engine(_) | SfuError::Store(_) | SfuError::Internal => {
                        warn!(target: "sfu.session", uid = %ctx.uid, event = name, error = %e, "Event failed");
                    }
                    _ => {
                        debug!(target: "sfu.session", uid = %ctx.uid, event = name, error = %e, "Event rejected");
                    }
                }
                self.hub.send(
                    &ctx.connection_id,
                    ServerEvent::Error {
                        event: name.to_string(),
                        code: e.error_code(),
                        message: e.client_message(),
                    },
                );
            }
        }
    }

    /// Handle one event and return the reply for the originating connection.
    pub async fn handle(
        &self,
        ctx: &ConnectionContext,
        event: ClientEvent,
    ) -> Result<Option<ServerEvent>, SfuError> {
        match event {
            ClientEvent::AnnounceCapabilities {
                room_id,
                rtp_capabilities,
            } => self
                .announce_capabilities(ctx, &room_id, rtp_capabilities)
                .await
                .map(Some),
            ClientEvent::Prepare { room_id } => self.prepare(ctx, &room_id).await.map(Some),
            ClientEvent::LeavePrepare => self.leave_prepare(ctx).await.map(Some),
            ClientEvent::Join { room_id, metadata } => {
                self.join(ctx, &room_id, metadata).await.map(Some)
            }
            ClientEvent::Heartbeat => self.heartbeat(ctx).await.map(|()| None),
            ClientEvent::CreateTransport { direction } => {
                self.create_transport(ctx, direction).await.map(Some)
            }
            ClientEvent::ConnectTransport {
                direction,
                dtls_parameters,
            } => self
                .connect_transport(ctx, direction, &dtls_parameters)
                .await
                .map(Some),
            ClientEvent::Produce {
                kind,
                rtp_parameters,
            } => self.produce(ctx, kind, &rtp_parameters).await.map(Some),
            ClientEvent::Consume { stream_id } => self.consume(ctx, &stream_id).await.map(Some),
            ClientEvent::ToggleMic => self.toggle_mic(ctx).await.map(|_| None),
            ClientEvent::ToggleVideo => self.toggle_video(ctx).await.map(|_| None),
            ClientEvent::PauseConsumer { consumer_id } => {
                self.pause_consumer(ctx, &consumer_id).await.map(Some)
            }
            ClientEvent::ResumeConsumer { consumer_id } => {
                self.resume_consumer(ctx, &consumer_id).await.map(Some)
            }
            ClientEvent::ListParticipants => self.list_participants(ctx).map(Some),
            ClientEvent::ListStreams => self.list_streams(ctx).map(Some),
            ClientEvent::Reconnect { room_id, metadata } => {
                self.reconnect(ctx, &room_id, metadata).await.map(Some)
            }
            ClientEvent::Leave => self.leave(ctx).await.map(Some),
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Record the client's receive capabilities. Creates the participant in
    /// `Announced` if it is not in the room yet.
    #[instrument(skip_all, fields(uid = %ctx.uid, room_id = %room_id))]
    pub async fn announce_capabilities(
        &self,
        ctx: &ConnectionContext,
        room_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ServerEvent, SfuError> {
        validate_rtp_capabilities(&rtp_capabilities)?;

        let room = self.locks.lock_room(room_id).await;
        let participant = self.locks.lock_participant_in(&room, &ctx.uid).await;
        let upserted = self.registry.upsert_participant(
            &room,
            &participant,
            SessionEvent::Announce,
            ParticipantUpdate {
                connection_id: Some(ctx.connection_id.clone()),
                metadata: None,
                rtp_capabilities: Some(rtp_capabilities),
            },
        )?;

        debug!(
            target: "sfu.session",
            inserted = upserted.inserted,
            state = ?upserted.current,
            "Capabilities announced"
        );
        Ok(ServerEvent::CapabilitiesAccepted {
            room_id: room_id.to_string(),
        })
    }

    /// Provision the router of a room known to the session store and return
    /// its capabilities ahead of join.
    #[instrument(skip_all, fields(uid = %ctx.uid, room_id = %room_id))]
    pub async fn prepare(
        &self,
        ctx: &ConnectionContext,
        room_id: &str,
    ) -> Result<ServerEvent, SfuError> {
        if !self.store.room_exists(room_id).await? {
            return Err(SfuError::not_found("Room", room_id));
        }
        let router = self.routers.get_or_create(room_id).await?;
        Ok(ServerEvent::Prepared {
            room_id: room_id.to_string(),
            rtp_capabilities: router.rtp_capabilities,
            participants: self.registry.participants(room_id),
        })
    }

    /// Drop a participant that announced capabilities but never joined.
    #[instrument(skip_all, fields(uid = %ctx.uid))]
    pub async fn leave_prepare(&self, ctx: &ConnectionContext) -> Result<ServerEvent, SfuError> {
        let room_id = self.room_of(&ctx.uid)?;
        let room = self.locks.lock_room(&room_id).await;
        let participant = self.locks.lock_participant_in(&room, &ctx.uid).await;

        self.registry.with_participant(&participant, |p| {
            if p.state != state::SessionState::Announced {
                return Err(SfuError::IllegalTransition {
                    from: p.state,
                    event: SessionEvent::Leave,
                });
            }
            Ok(())
        })?;
        self.remove_locked(&room, &participant, RemovalReason::LeavePrepare)
            .await;
        Ok(ServerEvent::PrepareLeft)
    }

    /// Admit the participant to a room, creating the room and its router if
    /// needed. A rejoin refreshes the connection and metadata.
    #[instrument(skip_all, fields(uid = %ctx.uid, room_id = %room_id))]
    pub async fn join(
        &self,
        ctx: &ConnectionContext,
        room_id: &str,
        metadata: ParticipantMetadata,
    ) -> Result<ServerEvent, SfuError> {
        let room = self.locks.lock_room(room_id).await;
        let router = self.routers.get_or_create_locked(&room).await?;
        let participant = self.locks.lock_participant_in(&room, &ctx.uid).await;

        let upserted = match self.registry.upsert_participant(
            &room,
            &participant,
            SessionEvent::Join,
            ParticipantUpdate {
                connection_id: Some(ctx.connection_id.clone()),
                metadata: Some(metadata),
                rtp_capabilities: None,
            },
        ) {
            Ok(upserted) => upserted,
            Err(e) => {
                if !self.registry.has_room(room_id) {
                    self.routers.close(&room).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.record_join(room_id, &ctx.uid).await {
            warn!(target: "sfu.session", error = %e, "Failed to record join");
        }

        let summary = self
            .registry
            .with_participant(&participant, |p| Ok(p.summary()))?;
        self.broadcast_to_others(
            room_id,
            &ctx.uid,
            &ServerEvent::ParticipantJoined {
                participant: summary,
            },
        );

        info!(
            target: "sfu.session",
            rejoin = !upserted.inserted,
            previous = ?upserted.previous,
            "Participant joined"
        );
        Ok(ServerEvent::Joined {
            room_id: room_id.to_string(),
            rtp_capabilities: router.rtp_capabilities,
            participants: self.registry.participants(room_id),
            streams: self.registry.streams(room_id, Some(&ctx.uid)),
        })
    }

    /// Restore a participant after a socket drop, within its grace period.
    #[instrument(skip_all, fields(uid = %ctx.uid, room_id = %room_id))]
    pub async fn reconnect(
        &self,
        ctx: &ConnectionContext,
        room_id: &str,
        metadata: Option<ParticipantMetadata>,
    ) -> Result<ServerEvent, SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        match self.registry.room_of(&ctx.uid) {
            Some(current) if current == room_id => {}
            Some(current) => {
                return Err(SfuError::Conflict(format!(
                    "Participant is in room {current}"
                )));
            }
            None => {
                return Err(SfuError::IllegalTransition {
                    from: state::SessionState::Absent,
                    event: SessionEvent::Reconnect,
                });
            }
        }

        let your_metadata = self.registry.with_participant(&participant, |p| {
            p.state = p.state.apply(SessionEvent::Reconnect)?;
            p.liveness.cancel();
            p.connection_id = Some(ctx.connection_id.clone());
            if let Some(metadata) = metadata {
                p.metadata = metadata;
            }
            Ok(p.metadata.clone())
        })?;

        self.broadcast_to_others(
            room_id,
            &ctx.uid,
            &ServerEvent::ParticipantReconnected {
                uid: ctx.uid.clone(),
            },
        );
        info!(target: "sfu.session", "Participant reconnected");

        Ok(ServerEvent::ReconnectionDone {
            participants: self.registry.participants(room_id),
            streams: self.registry.streams(room_id, Some(&ctx.uid)),
            your_metadata,
        })
    }

    /// Leave the room immediately, bypassing any grace period.
    #[instrument(skip_all, fields(uid = %ctx.uid))]
    pub async fn leave(&self, ctx: &ConnectionContext) -> Result<ServerEvent, SfuError> {
        let room_id = self.room_of(&ctx.uid)?;
        let room = self.locks.lock_room(&room_id).await;
        let participant = self.locks.lock_participant_in(&room, &ctx.uid).await;

        self.registry.with_participant(&participant, |p| {
            p.state.apply(SessionEvent::Leave).map(|_| ())
        })?;
        self.remove_locked(&room, &participant, RemovalReason::Leave)
            .await;
        Ok(ServerEvent::Left { room_id })
    }

    /// Remove a participant and release everything it holds. Closes the
    /// room's router when the room empties.
    ///
    /// Returns false if the participant was already gone; each engine
    /// object is closed and `participant-left` is sent at most once.
    pub async fn remove_locked(
        &self,
        room: &RoomGuard,
        participant: &ParticipantGuard<'_>,
        reason: RemovalReason,
    ) -> bool {
        let Some(removed) = self.registry.remove_participant(room, participant) else {
            return false;
        };
        let room_id = room.room_id();
        let record = removed.participant;
        let uid = record.uid.clone();
        let producers: Vec<String> = record.producers().iter().map(|p| p.id.clone()).collect();
        let consumers: Vec<String> = record.consumers.keys().cloned().collect();
        let transports: Vec<String> = record.transports.ids().map(str::to_string).collect();
        drop(record);

        for producer_id in &producers {
            self.engine.close_producer(producer_id).await;
        }
        for consumer_id in &consumers {
            self.engine.close_consumer(consumer_id).await;
        }
        for transport_id in &transports {
            self.engine.close_transport(transport_id).await;
        }

        if removed.room_emptied {
            self.routers.close(room).await;
        } else {
            self.broadcast_to_room(
                room_id,
                &ServerEvent::ParticipantLeft { uid: uid.clone() },
            );
        }

        if let Err(e) = self.store.record_leave(room_id, &uid).await {
            warn!(target: "sfu.session", room_id, uid = %uid, error = %e, "Failed to record leave");
        }
        metrics::record_participant_removed(reason.as_str());
        info!(
            target: "sfu.session",
            room_id,
            uid = %uid,
            reason = reason.as_str(),
            room_emptied = removed.room_emptied,
            "Participant removed"
        );
        true
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Re-arm the removal timer. A heartbeat from the grace period restores
    /// `Active` and binds the participant to the connection it arrived on.
    pub async fn heartbeat(&self, ctx: &ConnectionContext) -> Result<(), SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let restored = self.registry.with_participant(&participant, |p| {
            let previous = p.state;
            p.state = p.state.apply(SessionEvent::Heartbeat)?;
            let restored = previous == state::SessionState::GracePeriod;
            if restored || p.connection_id.is_none() {
                p.connection_id = Some(ctx.connection_id.clone());
            }
            self.arm_cleanup(p, self.settings.heartbeat_grace);
            Ok(restored)
        })?;
        if restored {
            info!(target: "sfu.session", uid = %ctx.uid, "Heartbeat restored participant");
        }
        Ok(())
    }

    /// Raw socket close. Starts the grace period unless the participant has
    /// already moved to a newer connection.
    #[instrument(skip_all, fields(uid = %ctx.uid))]
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let result = self.registry.with_participant(&participant, |p| {
            if p.connection_id.as_deref() != Some(ctx.connection_id.as_str()) {
                return Ok(false);
            }
            p.state = p.state.apply(SessionEvent::Disconnect)?;
            p.connection_id = None;
            self.arm_cleanup(p, self.settings.disconnect_grace);
            Ok(true)
        });
        match result {
            Ok(true) => info!(target: "sfu.session", "Participant disconnected, grace period started"),
            Ok(false) => debug!(target: "sfu.session", "Stale connection closed"),
            Err(e) => debug!(target: "sfu.session", error = %e, "Disconnect ignored"),
        }
    }

    /// Schedule removal after `after`, replacing any pending timer.
    fn arm_cleanup(&self, p: &mut ParticipantMut<'_>, after: Duration) {
        let this = self.this.clone();
        let uid = p.uid.clone();
        p.liveness.arm(after, move |generation| async move {
            if let Some(handler) = this.upgrade() {
                handler.on_cleanup_expired(&uid, generation).await;
            }
        });
    }

    async fn on_cleanup_expired(&self, uid: &str, generation: u64) {
        let Some(room_id) = self.registry.room_of(uid) else {
            return;
        };
        let room = self.locks.lock_room(&room_id).await;
        let participant = self.locks.lock_participant_in(&room, uid).await;
        let expired = self.registry.with_participant(&participant, |p| {
            if !p.liveness.disarm_if(generation) {
                return Ok(None);
            }
            let (event, reason) = match p.state {
                state::SessionState::Active => {
                    (SessionEvent::HeartbeatTimeout, RemovalReason::HeartbeatTimeout)
                }
                _ => (SessionEvent::GraceExpired, RemovalReason::GraceExpired),
            };
            p.state.apply(event)?;
            Ok(Some(reason))
        });
        match expired {
            Ok(Some(reason)) => {
                self.remove_locked(&room, &participant, reason).await;
            }
            Ok(None) => {}
            Err(e) => debug!(target: "sfu.session", uid, error = %e, "Cleanup timer ignored"),
        }
    }

    async fn on_pending_expired(&self, uid: &str, generation: u64) {
        let participant = self.locks.lock_participant(uid).await;
        let dropped = self.registry.with_participant(&participant, |p| {
            if !p.pending_expiry.disarm_if(generation) {
                return Ok(0);
            }
            Ok(std::mem::take(&mut p.pending_consumers).len())
        });
        if let Ok(dropped) = dropped {
            if dropped > 0 {
                debug!(target: "sfu.session", uid, dropped, "Unflushed pending consumers dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    /// Create the send or recv transport. A recv transport flushes the
    /// pending-consumer queue into the reply.
    #[instrument(skip_all, fields(uid = %ctx.uid, direction = direction.as_str()))]
    pub async fn create_transport(
        &self,
        ctx: &ConnectionContext,
        direction: TransportDirection,
    ) -> Result<ServerEvent, SfuError> {
        let room_id = self.room_of(&ctx.uid)?;
        let router = self.routers.get_or_create(&room_id).await?;

        let participant = self.locks.lock_participant(&ctx.uid).await;
        self.registry
            .with_participant(&participant, |p| require_active(p))?;

        let params = self
            .engine
            .create_transport(&router.router_id, &self.settings.transport_options)
            .await?;

        let committed = self.registry.with_participant(&participant, |p| {
            let replaced = p
                .transports
                .slot_mut(direction)
                .replace(TransportRecord {
                    id: params.id.clone(),
                    connected: false,
                })
                .map(|t| t.id);

            // objects on the replaced transport die with it
            let mut closed_streams: Vec<String> = Vec::new();
            let mut closed_consumers: Vec<String> = Vec::new();
            let mut pending: Vec<PendingConsumer> = Vec::new();
            match direction {
                TransportDirection::Send if replaced.is_some() => {
                    for kind in [StreamKind::Audio, StreamKind::Video, StreamKind::Screen] {
                        if let Some(producer) = p.detach_producer(kind) {
                            closed_streams.push(producer.id);
                        }
                    }
                    p.metadata.mic_on = false;
                    p.metadata.video_on = false;
                }
                TransportDirection::Send => {}
                TransportDirection::Recv => {
                    closed_consumers = p.consumers.drain().map(|(id, _)| id).collect();
                    p.pending_expiry.cancel();
                    pending = std::mem::take(&mut p.pending_consumers);
                }
            }
            Ok((replaced, closed_streams, closed_consumers, pending))
        });

        let (replaced, closed_streams, closed_consumers, pending_consumers) = match committed {
            Ok(committed) => committed,
            Err(e) => {
                self.engine.close_transport(&params.id).await;
                return Err(e);
            }
        };

        for stream_id in closed_streams {
            self.engine.close_producer(&stream_id).await;
            self.broadcast_to_others(
                &room_id,
                &ctx.uid,
                &ServerEvent::StreamClosed {
                    stream_id,
                    uid: ctx.uid.clone(),
                },
            );
        }
        for consumer_id in closed_consumers {
            self.engine.close_consumer(&consumer_id).await;
        }
        if let Some(old) = replaced {
            self.engine.close_transport(&old).await;
        }

        debug!(
            target: "sfu.session",
            transport_id = %params.id,
            flushed = pending_consumers.len(),
            "Transport created"
        );
        Ok(ServerEvent::TransportCreated {
            direction,
            params,
            pending_consumers,
        })
    }

    /// Complete the DTLS handshake of a transport. Connecting the recv
    /// transport replies with the streams available to consume.
    #[instrument(skip_all, fields(uid = %ctx.uid, direction = direction.as_str()))]
    pub async fn connect_transport(
        &self,
        ctx: &ConnectionContext,
        direction: TransportDirection,
        dtls_parameters: &Value,
    ) -> Result<ServerEvent, SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let transport_id = self.registry.with_participant(&participant, |p| {
            require_active(p)?;
            p.transports
                .get(direction)
                .map(|t| t.id.clone())
                .ok_or_else(|| SfuError::not_found("Transport", direction.as_str()))
        })?;

        self.engine
            .connect_transport(&transport_id, dtls_parameters)
            .await?;

        let streams = self.registry.with_participant(&participant, |p| {
            if let Some(transport) = p.transports.slot_mut(direction) {
                if transport.id == transport_id {
                    transport.connected = true;
                }
            }
            Ok(match direction {
                TransportDirection::Recv => p.other_streams(),
                TransportDirection::Send => Vec::new(),
            })
        })?;

        Ok(ServerEvent::TransportConnected { direction, streams })
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Publish a stream. A producer already in the same slot is replaced
    /// and closed.
    #[instrument(skip_all, fields(uid = %ctx.uid, kind = kind.as_str()))]
    pub async fn produce(
        &self,
        ctx: &ConnectionContext,
        kind: StreamKind,
        rtp_parameters: &Value,
    ) -> Result<ServerEvent, SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let (room_id, transport_id) = {
            let room_id = self.room_of(&ctx.uid)?;
            let transport_id = self.registry.with_participant(&participant, |p| {
                require_active(p)?;
                p.transports
                    .send
                    .as_ref()
                    .map(|t| t.id.clone())
                    .ok_or_else(|| SfuError::not_found("Transport", "send"))
            })?;
            (room_id, transport_id)
        };

        let producer_id = self
            .engine
            .produce(&transport_id, kind.media_kind(), rtp_parameters)
            .await?;

        let committed = self.registry.with_participant(&participant, |p| {
            let replaced = p.attach_producer(ProducerRecord {
                id: producer_id.clone(),
                kind,
                paused: false,
            });
            match kind {
                StreamKind::Audio => p.metadata.mic_on = true,
                StreamKind::Video => p.metadata.video_on = true,
                StreamKind::Screen => {}
            }
            Ok(replaced)
        });
        let replaced = match committed {
            Ok(replaced) => replaced,
            Err(e) => {
                self.engine.close_producer(&producer_id).await;
                return Err(e);
            }
        };

        if let Some(old) = replaced {
            self.engine.close_producer(&old.id).await;
            self.broadcast_to_others(
                &room_id,
                &ctx.uid,
                &ServerEvent::StreamClosed {
                    stream_id: old.id,
                    uid: ctx.uid.clone(),
                },
            );
        }

        self.broadcast_to_others(
            &room_id,
            &ctx.uid,
            &ServerEvent::NewStream {
                stream: StreamInfo {
                    stream_id: producer_id.clone(),
                    uid: ctx.uid.clone(),
                    kind,
                },
            },
        );
        info!(target: "sfu.session", stream_id = %producer_id, "Stream published");

        Ok(ServerEvent::Produced {
            stream_id: producer_id,
            kind,
        })
    }

    /// Flip the microphone: pause or resume the audio producer and broadcast
    /// the new state to the whole room. Returns `None` without a producer.
    #[instrument(skip_all, fields(uid = %ctx.uid))]
    pub async fn toggle_mic(&self, ctx: &ConnectionContext) -> Result<Option<bool>, SfuError> {
        self.toggle(ctx, StreamKind::Audio).await
    }

    /// Flip the camera. Returns `None` without a video producer.
    #[instrument(skip_all, fields(uid = %ctx.uid))]
    pub async fn toggle_video(&self, ctx: &ConnectionContext) -> Result<Option<bool>, SfuError> {
        self.toggle(ctx, StreamKind::Video).await
    }

    async fn toggle(
        &self,
        ctx: &ConnectionContext,
        kind: StreamKind,
    ) -> Result<Option<bool>, SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let room_id = self.room_of(&ctx.uid)?;
        let producer = self.registry.with_participant(&participant, |p| {
            require_active(p)?;
            Ok(p.producers().get(kind).cloned())
        })?;
        let Some(producer) = producer else {
            return Ok(None);
        };

        let enabled = producer.paused;
        if enabled {
            self.engine.resume_producer(&producer.id).await?;
        } else {
            self.engine.pause_producer(&producer.id).await?;
        }

        self.registry.with_participant(&participant, |p| {
            p.set_producer_paused(kind, !enabled);
            match kind {
                StreamKind::Audio => p.metadata.mic_on = enabled,
                StreamKind::Video => p.metadata.video_on = enabled,
                StreamKind::Screen => {}
            }
            Ok(())
        })?;

        let event = match kind {
            StreamKind::Audio => ServerEvent::MicToggled {
                uid: ctx.uid.clone(),
                mic_on: enabled,
            },
            StreamKind::Video | StreamKind::Screen => ServerEvent::VideoToggled {
                uid: ctx.uid.clone(),
                video_on: enabled,
            },
        };
        self.broadcast_to_room(&room_id, &event);
        Ok(Some(enabled))
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Subscribe to a stream. Without a recv transport the request is
    /// queued and flushed when the transport is created.
    #[instrument(skip_all, fields(uid = %ctx.uid, stream_id = %stream_id))]
    pub async fn consume(
        &self,
        ctx: &ConnectionContext,
        stream_id: &str,
    ) -> Result<ServerEvent, SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let plan = self.registry.with_participant(&participant, |p| {
            require_active(p)?;
            let stream = p
                .stream(stream_id)
                .ok_or_else(|| SfuError::not_found("Stream", stream_id))?;
            if stream.uid == p.uid {
                return Err(SfuError::InvalidInput(
                    "Cannot consume own stream".to_string(),
                ));
            }
            let rtp_capabilities = p.rtp_capabilities.clone().ok_or_else(|| {
                SfuError::InvalidInput("RTP capabilities not announced".to_string())
            })?;

            let Some(transport_id) = p.transports.recv.as_ref().map(|t| t.id.clone()) else {
                self.queue_pending(
                    p,
                    PendingConsumer {
                        stream_id: stream_id.to_string(),
                        kind: stream.kind,
                        from_uid: stream.uid,
                    },
                );
                return Ok(ConsumePlan::Queued);
            };
            Ok(ConsumePlan::Ready {
                transport_id,
                from_uid: stream.uid,
                kind: stream.kind,
                rtp_capabilities,
            })
        })?;

        let (transport_id, from_uid, kind, rtp_capabilities) = match plan {
            ConsumePlan::Queued => {
                debug!(target: "sfu.session", "Consume queued until recv transport exists");
                return Ok(ServerEvent::ConsumeQueued {
                    stream_id: stream_id.to_string(),
                });
            }
            ConsumePlan::Ready {
                transport_id,
                from_uid,
                kind,
                rtp_capabilities,
            } => (transport_id, from_uid, kind, rtp_capabilities),
        };

        let consumer = self
            .engine
            .consume(&transport_id, stream_id, &rtp_capabilities)
            .await?;

        let committed = self.registry.with_participant(&participant, |p| {
            p.consumers.insert(
                consumer.id.clone(),
                ConsumerRecord {
                    id: consumer.id.clone(),
                    producer_id: consumer.producer_id.clone(),
                    kind: consumer.kind,
                    paused: false,
                },
            );
            Ok(())
        });
        if let Err(e) = committed {
            self.engine.close_consumer(&consumer.id).await;
            return Err(e);
        }

        Ok(ServerEvent::ConsumerCreated {
            consumer,
            from_uid,
            stream_kind: kind,
        })
    }

    fn queue_pending(&self, p: &mut ParticipantMut<'_>, request: PendingConsumer) {
        if p
            .pending_consumers
            .iter()
            .any(|queued| queued.stream_id == request.stream_id)
        {
            return;
        }
        let first = p.pending_consumers.is_empty();
        p.pending_consumers.push(request);
        if first {
            let this = self.this.clone();
            let uid = p.uid.clone();
            p.pending_expiry
                .arm(self.settings.disconnect_grace, move |generation| async move {
                    if let Some(handler) = this.upgrade() {
                        handler.on_pending_expired(&uid, generation).await;
                    }
                });
        }
    }

    #[instrument(skip_all, fields(uid = %ctx.uid, consumer_id = %consumer_id))]
    pub async fn pause_consumer(
        &self,
        ctx: &ConnectionContext,
        consumer_id: &str,
    ) -> Result<ServerEvent, SfuError> {
        self.set_consumer_paused(ctx, consumer_id, true).await?;
        Ok(ServerEvent::ConsumerPaused {
            consumer_id: consumer_id.to_string(),
        })
    }

    #[instrument(skip_all, fields(uid = %ctx.uid, consumer_id = %consumer_id))]
    pub async fn resume_consumer(
        &self,
        ctx: &ConnectionContext,
        consumer_id: &str,
    ) -> Result<ServerEvent, SfuError> {
        self.set_consumer_paused(ctx, consumer_id, false).await?;
        Ok(ServerEvent::ConsumerResumed {
            consumer_id: consumer_id.to_string(),
        })
    }

    /// Shared body of pause and resume. Already in the requested state is a
    /// no-op. A consumer the engine no longer knows is dropped from the
    /// record and reported as not found.
    async fn set_consumer_paused(
        &self,
        ctx: &ConnectionContext,
        consumer_id: &str,
        paused: bool,
    ) -> Result<(), SfuError> {
        let participant = self.locks.lock_participant(&ctx.uid).await;
        let current = self.registry.with_participant(&participant, |p| {
            require_active(p)?;
            p.consumers
                .get(consumer_id)
                .map(|c| c.paused)
                .ok_or_else(|| SfuError::not_found("Consumer", consumer_id))
        })?;
        if current == paused {
            return Ok(());
        }

        let result = if paused {
            self.engine.pause_consumer(consumer_id).await
        } else {
            self.engine.resume_consumer(consumer_id).await
        };
        if let Err(e) = result {
            if matches!(e, crate::engine::EngineError::Unknown { .. }) {
                self.registry.with_participant(&participant, |p| {
                    p.consumers.remove(consumer_id);
                    Ok(())
                })?;
                return Err(SfuError::not_found("Consumer", consumer_id));
            }
            return Err(e.into());
        }

        self.registry.with_participant(&participant, |p| {
            if let Some(consumer) = p.consumers.get_mut(consumer_id) {
                consumer.paused = paused;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    pub fn list_participants(&self, ctx: &ConnectionContext) -> Result<ServerEvent, SfuError> {
        let room_id = self.room_of(&ctx.uid)?;
        Ok(ServerEvent::ParticipantList {
            participants: self.registry.participants(&room_id),
        })
    }

    /// Streams in the caller's room, excluding its own.
    pub fn list_streams(&self, ctx: &ConnectionContext) -> Result<ServerEvent, SfuError> {
        let room_id = self.room_of(&ctx.uid)?;
        Ok(ServerEvent::StreamList {
            streams: self.registry.streams(&room_id, Some(&ctx.uid)),
        })
    }
}

#[async_trait]
impl RouterLossListener for SessionHandler {
    /// Forget the media state of every member of a room whose router died
    /// with its worker. The engine objects are already gone; membership and
    /// session state are kept, and clients rebuild transports on the next
    /// router.
    async fn router_lost(&self, room: &RoomGuard) {
        let room_id = room.room_id();
        let mut closed_streams: Vec<(String, String)> = Vec::new();
        for member in self.registry.participants(room_id) {
            let participant = self.locks.lock_participant_in(room, &member.uid).await;
            match self
                .registry
                .with_participant(&participant, |p| Ok(p.drop_media()))
            {
                Ok(streams) => closed_streams
                    .extend(streams.into_iter().map(|id| (id, member.uid.clone()))),
                Err(e) => {
                    debug!(target: "sfu.session", room_id, uid = %member.uid, error = %e, "Member gone before media release");
                }
            }
        }

        let streams = closed_streams.len();
        for (stream_id, uid) in closed_streams {
            self.broadcast_to_room(room_id, &ServerEvent::StreamClosed { stream_id, uid });
        }
        warn!(target: "sfu.session", room_id, streams, "Media state released after router loss");
    }
}
