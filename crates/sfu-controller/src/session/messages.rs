//! Signaling wire messages.
//!
//! Both directions are JSON objects `{"event": "<kebab-name>", "data": {...}}`
//! with camelCase payload fields. Events without a payload omit `data`.

use crate::engine::{ConsumerParams, TransportDirection, TransportParams};
use crate::registry::{ParticipantMetadata, ParticipantSummary, PendingConsumer, StreamInfo, StreamKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests sent by a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    AnnounceCapabilities {
        room_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    Prepare { room_id: String },
    LeavePrepare,
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        #[serde(default)]
        metadata: ParticipantMetadata,
    },
    Heartbeat,
    CreateTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        direction: TransportDirection,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: StreamKind,
        rtp_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Consume { stream_id: String },
    ToggleMic,
    ToggleVideo,
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    ListParticipants,
    ListStreams,
    #[serde(rename_all = "camelCase")]
    Reconnect {
        room_id: String,
        #[serde(default)]
        metadata: Option<ParticipantMetadata>,
    },
    Leave,
}

impl ClientEvent {
    /// Wire name, used in error replies and as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::AnnounceCapabilities { .. } => "announce-capabilities",
            ClientEvent::Prepare { .. } => "prepare",
            ClientEvent::LeavePrepare => "leave-prepare",
            ClientEvent::Join { .. } => "join",
            ClientEvent::Heartbeat => "heartbeat",
            ClientEvent::CreateTransport { .. } => "create-transport",
            ClientEvent::ConnectTransport { .. } => "connect-transport",
            ClientEvent::Produce { .. } => "produce",
            ClientEvent::Consume { .. } => "consume",
            ClientEvent::ToggleMic => "toggle-mic",
            ClientEvent::ToggleVideo => "toggle-video",
            ClientEvent::PauseConsumer { .. } => "pause-consumer",
            ClientEvent::ResumeConsumer { .. } => "resume-consumer",
            ClientEvent::ListParticipants => "list-participants",
            ClientEvent::ListStreams => "list-streams",
            ClientEvent::Reconnect { .. } => "reconnect",
            ClientEvent::Leave => "leave",
        }
    }
}

/// Replies and broadcasts sent to client connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    CapabilitiesAccepted { room_id: String },
    #[serde(rename_all = "camelCase")]
    Prepared {
        room_id: String,
        rtp_capabilities: Value,
        participants: Vec<ParticipantSummary>,
    },
    PrepareLeft,
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: String,
        rtp_capabilities: Value,
        participants: Vec<ParticipantSummary>,
        streams: Vec<StreamInfo>,
    },
    ParticipantJoined { participant: ParticipantSummary },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        direction: TransportDirection,
        params: TransportParams,
        /// Queued consume requests, flushed when the recv transport opens.
        pending_consumers: Vec<PendingConsumer>,
    },
    TransportConnected {
        direction: TransportDirection,
        streams: Vec<StreamInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Produced { stream_id: String, kind: StreamKind },
    NewStream { stream: StreamInfo },
    #[serde(rename_all = "camelCase")]
    StreamClosed { stream_id: String, uid: String },
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer: ConsumerParams,
        from_uid: String,
        stream_kind: StreamKind,
    },
    #[serde(rename_all = "camelCase")]
    ConsumeQueued { stream_id: String },
    #[serde(rename_all = "camelCase")]
    MicToggled { uid: String, mic_on: bool },
    #[serde(rename_all = "camelCase")]
    VideoToggled { uid: String, video_on: bool },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },
    ParticipantList { participants: Vec<ParticipantSummary> },
    StreamList { streams: Vec<StreamInfo> },
    #[serde(rename_all = "camelCase")]
    ReconnectionDone {
        participants: Vec<ParticipantSummary>,
        streams: Vec<StreamInfo>,
        your_metadata: ParticipantMetadata,
    },
    ParticipantReconnected { uid: String },
    ParticipantLeft { uid: String },
    #[serde(rename_all = "camelCase")]
    Left { room_id: String },
    Error {
        event: String,
        code: i32,
        message: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_format() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "produce",
            "data": { "kind": "screen", "rtpParameters": { "codecs": [] } }
        }))
        .unwrap();
        assert_eq!(event.name(), "produce");
        assert!(matches!(
            event,
            ClientEvent::Produce {
                kind: StreamKind::Screen,
                ..
            }
        ));
    }

    #[test]
    fn test_unit_events_need_no_data() {
        let event: ClientEvent = serde_json::from_value(json!({ "event": "heartbeat" })).unwrap();
        assert_eq!(event, ClientEvent::Heartbeat);

        let event: ClientEvent =
            serde_json::from_value(json!({ "event": "toggle-mic" })).unwrap();
        assert_eq!(event, ClientEvent::ToggleMic);
    }

    #[test]
    fn test_join_metadata_defaults() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "join",
            "data": { "roomId": "room-1" }
        }))
        .unwrap();
        match event {
            ClientEvent::Join { room_id, metadata } => {
                assert_eq!(room_id, "room-1");
                assert_eq!(metadata, ParticipantMetadata::default());
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = serde_json::from_value::<ClientEvent>(json!({ "event": "hang-up" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_event_wire_format() {
        let value = serde_json::to_value(ServerEvent::MicToggled {
            uid: "alice".to_string(),
            mic_on: false,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "event": "mic-toggled", "data": { "uid": "alice", "micOn": false } })
        );

        let value = serde_json::to_value(ServerEvent::Error {
            event: "consume".to_string(),
            code: 4,
            message: "Stream not found".to_string(),
        })
        .unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["event"], "consume");
    }
}
