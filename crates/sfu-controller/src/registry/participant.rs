//! Participant records.

use crate::engine::{MediaKind, TransportDirection};
use crate::session::liveness::Liveness;
use crate::session::state::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A published stream slot. Screen share is carried as video by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
    Screen,
}

impl StreamKind {
    pub fn media_kind(self) -> MediaKind {
        match self {
            StreamKind::Audio => MediaKind::Audio,
            StreamKind::Video | StreamKind::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Screen => "screen",
        }
    }
}

/// Display metadata shown to other participants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantMetadata {
    pub display_name: String,
    pub photo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub mic_on: bool,
    pub video_on: bool,
    pub is_speaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    pub id: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub id: String,
    pub kind: StreamKind,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// A consume request parked until the recv transport exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConsumer {
    pub stream_id: String,
    pub kind: StreamKind,
    pub from_uid: String,
}

#[derive(Debug, Default)]
pub struct Transports {
    pub send: Option<TransportRecord>,
    pub recv: Option<TransportRecord>,
}

impl Transports {
    pub fn get(&self, direction: TransportDirection) -> Option<&TransportRecord> {
        match direction {
            TransportDirection::Send => self.send.as_ref(),
            TransportDirection::Recv => self.recv.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, direction: TransportDirection) -> &mut Option<TransportRecord> {
        match direction {
            TransportDirection::Send => &mut self.send,
            TransportDirection::Recv => &mut self.recv,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.send
            .iter()
            .chain(self.recv.iter())
            .map(|t| t.id.as_str())
    }
}

/// Producer slots. Only the registry writes slots so that the room's
/// producer index stays in step.
#[derive(Debug, Default)]
pub struct Producers {
    audio: Option<ProducerRecord>,
    video: Option<ProducerRecord>,
    screen: Option<ProducerRecord>,
}

impl Producers {
    pub fn get(&self, kind: StreamKind) -> Option<&ProducerRecord> {
        match kind {
            StreamKind::Audio => self.audio.as_ref(),
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Screen => self.screen.as_ref(),
        }
    }

    pub(super) fn slot_mut(&mut self, kind: StreamKind) -> &mut Option<ProducerRecord> {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
            StreamKind::Screen => &mut self.screen,
        }
    }

    /// Pause state is engine-mirrored and may be written by callers.
    pub fn set_paused(&mut self, kind: StreamKind, paused: bool) {
        if let Some(producer) = self.slot_mut(kind) {
            producer.paused = paused;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProducerRecord> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .chain(self.screen.iter())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One participant's session state and media handles.
#[derive(Debug)]
pub struct Participant {
    pub uid: String,
    pub connection_id: Option<String>,
    pub rtp_capabilities: Option<Value>,
    pub transports: Transports,
    pub(super) producers: Producers,
    pub consumers: HashMap<String, ConsumerRecord>,
    pub pending_consumers: Vec<PendingConsumer>,
    pub metadata: ParticipantMetadata,
    pub state: SessionState,
    pub joined_at: DateTime<Utc>,
    /// Grace/heartbeat timer. Armed only while a window is pending.
    pub liveness: Liveness,
    /// Safety timer that drops a pending-consumer queue nobody flushed.
    pub pending_expiry: Liveness,
}

impl Participant {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            connection_id: None,
            rtp_capabilities: None,
            transports: Transports::default(),
            producers: Producers::default(),
            consumers: HashMap::new(),
            pending_consumers: Vec::new(),
            metadata: ParticipantMetadata::default(),
            state: SessionState::Absent,
            joined_at: Utc::now(),
            liveness: Liveness::new(),
            pending_expiry: Liveness::new(),
        }
    }

    pub fn producers(&self) -> &Producers {
        &self.producers
    }

    pub fn set_producer_paused(&mut self, kind: StreamKind, paused: bool) {
        self.producers.set_paused(kind, paused);
    }

    /// Whether a grace or heartbeat window is pending.
    pub fn cleanup_pending(&self) -> bool {
        self.liveness.is_armed()
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            uid: self.uid.clone(),
            metadata: self.metadata.clone(),
            state: self.state,
        }
    }
}

/// Listing entry sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub uid: String,
    pub metadata: ParticipantMetadata,
    pub state: SessionState,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn producer(id: &str, kind: StreamKind) -> ProducerRecord {
        ProducerRecord {
            id: id.to_string(),
            kind,
            paused: false,
        }
    }

    #[test]
    fn test_screen_is_carried_as_video() {
        assert_eq!(StreamKind::Screen.media_kind(), MediaKind::Video);
        assert_eq!(StreamKind::Audio.media_kind(), MediaKind::Audio);
    }

    #[test]
    fn test_producer_slots() {
        let mut producers = Producers::default();
        assert!(producers.is_empty());

        *producers.slot_mut(StreamKind::Audio) = Some(producer("a", StreamKind::Audio));
        *producers.slot_mut(StreamKind::Screen) = Some(producer("s", StreamKind::Screen));
        assert_eq!(producers.len(), 2);
        assert!(producers.get(StreamKind::Video).is_none());

        producers.set_paused(StreamKind::Audio, true);
        assert!(producers.get(StreamKind::Audio).unwrap().paused);
    }

    #[test]
    fn test_transport_ids() {
        let mut transports = Transports::default();
        *transports.slot_mut(TransportDirection::Recv) = Some(TransportRecord {
            id: "recv-1".to_string(),
            connected: false,
        });
        assert_eq!(transports.ids().collect::<Vec<_>>(), vec!["recv-1"]);
        assert!(transports.get(TransportDirection::Send).is_none());
    }

    #[test]
    fn test_metadata_wire_names() {
        let metadata = ParticipantMetadata {
            display_name: "Alice".to_string(),
            mic_on: true,
            ..ParticipantMetadata::default()
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["displayName"], "Alice");
        assert_eq!(value["micOn"], true);
        assert!(value.get("color").is_none());

        let parsed: ParticipantMetadata =
            serde_json::from_value(serde_json::json!({ "displayName": "Bob" })).unwrap();
        assert_eq!(parsed.display_name, "Bob");
        assert!(!parsed.video_on);
    }
}
