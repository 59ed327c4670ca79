//! Router media codecs.

use super::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A codec a router is willing to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecCapability {
    fn new(kind: MediaKind, mime_type: &str, clock_rate: u32) -> Self {
        Self {
            kind,
            mime_type: mime_type.to_string(),
            clock_rate,
            channels: None,
            parameters: Map::new(),
        }
    }

    fn channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    fn parameters(mut self, parameters: Value) -> Self {
        if let Value::Object(map) = parameters {
            self.parameters = map;
        }
        self
    }
}

/// Codecs every router is created with: Opus and PCMU for audio, VP8 and
/// H264 (constrained baseline, packetization mode 1) for video.
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000)
            .channels(2)
            .parameters(json!({ "useinbandfec": 1, "usedtx": 1 })),
        RtpCodecCapability::new(MediaKind::Audio, "audio/PCMU", 8000),
        RtpCodecCapability::new(MediaKind::Video, "video/VP8", 90000).parameters(json!({
            "x-google-start-bitrate": 1000,
            "x-google-max-bitrate": 2000,
            "x-google-min-bitrate": 100,
        })),
        RtpCodecCapability::new(MediaKind::Video, "video/H264", 90000).parameters(json!({
            "packetization-mode": 1,
            "profile-level-id": "4d0032",
            "level-asymmetry-allowed": 1,
        })),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codecs_cover_both_kinds() {
        let codecs = default_media_codecs();
        assert_eq!(codecs.len(), 4);
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Video));
    }

    #[test]
    fn test_opus_is_stereo_48k() {
        let codecs = default_media_codecs();
        let opus = codecs
            .iter()
            .find(|c| c.mime_type == "audio/opus")
            .expect("opus present");
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));
        assert_eq!(opus.parameters.get("useinbandfec"), Some(&json!(1)));
    }

    #[test]
    fn test_serialized_shape() {
        let codecs = default_media_codecs();
        let h264 = codecs
            .iter()
            .find(|c| c.mime_type == "video/H264")
            .expect("h264 present");
        let value = serde_json::to_value(h264).unwrap();
        assert_eq!(value["kind"], "video");
        assert_eq!(value["clockRate"], 90000);
        assert_eq!(value["parameters"]["profile-level-id"], "4d0032");
        assert!(value.get("channels").is_none());
    }
}
