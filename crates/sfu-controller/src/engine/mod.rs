//! Media engine boundary.
//!
//! The media-forwarding engine (packet encryption, codec negotiation, RTP
//! forwarding) runs in external worker processes. The controller only talks
//! to it through [`MediaEngine`]; everything passed across the boundary is
//! opaque JSON except the identifiers the controller indexes by.
//!
//! [`loopback::LoopbackEngine`] is an in-process implementation used for
//! local runs and tests.

pub mod codecs;
pub mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use codecs::{default_media_codecs, RtpCodecCapability};

/// Errors surfaced by the media engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused the request (bad parameters, wrong state).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The referenced engine object does not exist (or was closed).
    #[error("unknown {kind} {id}")]
    Unknown { kind: &'static str, id: String },

    /// The worker process owning the object is gone.
    #[error("worker closed")]
    WorkerClosed,

    /// The worker process could not be spawned.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
}

/// Audio or video, as understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Transport direction relative to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Settings every worker process is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
}

/// Handle to a running worker process.
///
/// `died` is cancelled by the engine when the process exits unexpectedly.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: u32,
    pub died: CancellationToken,
}

/// Raw resource usage reported for a worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerResourceUsage {
    /// Peak resident set size in KiB.
    pub max_rss_kb: u64,
    /// Cumulative user CPU time in milliseconds.
    pub user_time_ms: u64,
    /// Cumulative system CPU time in milliseconds.
    pub system_time_ms: u64,
}

impl WorkerResourceUsage {
    pub fn memory_mb(&self) -> u64 {
        self.max_rss_kb / 1024
    }

    pub fn cpu_time_ms(&self) -> u64 {
        self.user_time_ms.saturating_add(self.system_time_ms)
    }
}

/// A router created on a worker.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    pub id: String,
    pub rtp_capabilities: Value,
}

/// Listen options for WebRTC transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Connection parameters of a freshly created transport, returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// A consumer created on a recv transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Operations the controller needs from the media engine.
///
/// Close operations are infallible and idempotent: closing an object that is
/// already gone is a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerHandle, EngineError>;

    async fn worker_resource_usage(
        &self,
        worker: &WorkerHandle,
    ) -> Result<WorkerResourceUsage, EngineError>;

    async fn close_worker(&self, worker: &WorkerHandle);

    async fn create_router(
        &self,
        worker: &WorkerHandle,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, EngineError>;

    async fn close_router(&self, router_id: &str);

    async fn create_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &str);

    /// Returns the new producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<String, EngineError>;

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &str);

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerParams, EngineError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &str);
}
