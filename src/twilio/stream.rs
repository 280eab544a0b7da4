use serde::Deserialize;

use crate::relay::frame::FrameKind;

/// Media stream events sent by the telephony provider.
///
/// Twilio uses camelCase ids (`streamSid`), Exotel uses snake_case; both are accepted.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(default, rename = "streamSid", alias = "stream_sid")]
        stream_sid: Option<String>,
        #[serde(default)]
        start: Option<StartMetadata>,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },
    Stop {
        #[serde(default, rename = "streamSid", alias = "stream_sid")]
        stream_sid: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct StartMetadata {
    #[serde(default, rename = "streamSid", alias = "stream_sid")]
    pub stream_sid: Option<String>,
    #[serde(default, rename = "callSid", alias = "call_sid")]
    pub call_sid: Option<String>,
    #[serde(default, rename = "mediaFormat", alias = "media_format")]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default, rename = "sampleRate", alias = "sample_rate")]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    pub payload: String, // base64-encoded mu-law audio
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    #[serde(default)]
    pub name: Option<String>,
}

impl StreamEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            StreamEvent::Media { .. } => FrameKind::Media,
            StreamEvent::Other => FrameKind::Unknown,
            _ => FrameKind::Control,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Start { .. } => "start",
            StreamEvent::Media { .. } => "media",
            StreamEvent::Mark { .. } => "mark",
            StreamEvent::Stop { .. } => "stop",
            StreamEvent::Other => "other",
        }
    }

    /// Stream id announced by a `start` event, top-level first.
    pub fn started_stream_sid(&self) -> Option<&str> {
        match self {
            StreamEvent::Start { stream_sid, start } => stream_sid
                .as_deref()
                .or_else(|| start.as_ref().and_then(|s| s.stream_sid.as_deref())),
            _ => None,
        }
    }
}

/// Build a `media` event that plays `payload` (base64 mu-law) on the call.
pub fn media_message(stream_sid: Option<&str>, payload: &str) -> String {
    let mut msg = serde_json::json!({
        "event": "media",
        "media": { "payload": payload }
    });
    if let Some(sid) = stream_sid {
        msg["streamSid"] = serde_json::json!(sid);
    }
    msg.to_string()
}

/// Build a `clear` event that flushes audio the provider has buffered for playback.
pub fn clear_message(stream_sid: Option<&str>) -> String {
    let mut msg = serde_json::json!({ "event": "clear" });
    if let Some(sid) = stream_sid {
        msg["streamSid"] = serde_json::json!(sid);
    }
    msg.to_string()
}
