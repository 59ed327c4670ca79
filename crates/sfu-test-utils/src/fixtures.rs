//! Pre-configured test data: client capabilities, RTP and DTLS parameters
//! and participant metadata.

use serde_json::{json, Value};
use sfu_controller::registry::{ParticipantMetadata, StreamKind};

/// Receive capabilities of a client that decodes Opus and VP8.
#[must_use]
pub fn rtp_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000
            }
        ],
        "headerExtensions": []
    })
}

/// Capabilities of an audio-only client.
#[must_use]
pub fn audio_only_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }
        ],
        "headerExtensions": []
    })
}

/// Send parameters for a producer of `kind`.
#[must_use]
pub fn rtp_parameters(kind: StreamKind) -> Value {
    let codec = match kind.media_kind() {
        sfu_controller::engine::MediaKind::Audio => {
            json!({ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2 })
        }
        sfu_controller::engine::MediaKind::Video => {
            json!({ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 })
        }
    };
    json!({
        "mid": kind.as_str(),
        "codecs": [codec],
        "encodings": [{ "ssrc": 1111 }],
        "rtcp": { "cname": "test" }
    })
}

/// Client DTLS parameters for `connect-transport`.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "AF:2C:15:63:0B:7E:91:0A:CC:42:3D:11:9F:EE:57:60:2B:48:1A:9C:53:71:D0:88:64:0E:CA:3B:27:F5:19:B6"
        }]
    })
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    pub uid: String,
    pub metadata: ParticipantMetadata,
}

impl TestParticipant {
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            metadata: ParticipantMetadata {
                display_name: uid.clone(),
                ..ParticipantMetadata::default()
            },
            uid,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.display_name = name.into();
        self
    }

    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.metadata.color = Some(color.into());
        self
    }
}
