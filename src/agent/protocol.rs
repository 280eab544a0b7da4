use serde::Deserialize;

use crate::relay::frame::FrameKind;

/// A message received from the conversational agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Synthesized speech for the caller (base64, same encoding the caller sends).
    Audio { payload: String },
    /// Keep-alive the agent expects a `pong` for.
    Ping { event_id: Option<u64> },
    /// The caller barged in; queued playback should be discarded.
    Interruption,
    /// Any other typed agent event (metadata, transcripts, VAD scores, ...).
    Other { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawAgentMessage {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default, rename = "audioChunk")]
    audio_chunk: Option<String>,
    #[serde(default)]
    audio_event: Option<AudioEvent>,
    #[serde(default)]
    ping_event: Option<PingEvent>,
}

#[derive(Debug, Deserialize)]
struct AudioEvent {
    audio_base_64: String,
}

#[derive(Debug, Deserialize)]
struct PingEvent {
    #[serde(default)]
    event_id: Option<u64>,
}

impl AgentEvent {
    pub fn parse(text: &str) -> Result<Self, AgentParseError> {
        let raw: RawAgentMessage =
            serde_json::from_str(text).map_err(|e| AgentParseError::Json(e.to_string()))?;

        if let Some(payload) = raw.audio_chunk {
            return Ok(AgentEvent::Audio { payload });
        }

        match raw.kind.as_deref() {
            Some("audio") => raw
                .audio_event
                .map(|a| AgentEvent::Audio {
                    payload: a.audio_base_64,
                })
                .ok_or(AgentParseError::MissingField("audio_event")),
            Some("ping") => Ok(AgentEvent::Ping {
                event_id: raw.ping_event.and_then(|p| p.event_id),
            }),
            Some("interruption") => Ok(AgentEvent::Interruption),
            Some(other) => Ok(AgentEvent::Other {
                kind: other.to_string(),
            }),
            None => Err(AgentParseError::Unrecognized),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            AgentEvent::Audio { .. } => FrameKind::Media,
            AgentEvent::Ping { .. } | AgentEvent::Interruption => FrameKind::Control,
            AgentEvent::Other { .. } => FrameKind::Unknown,
        }
    }
}

/// Wrap caller audio the way the agent expects it: `{"<field>": "<payload>"}`.
pub fn audio_chunk_message(field: &str, payload: &str) -> String {
    let mut msg = serde_json::Map::with_capacity(1);
    msg.insert(field.to_string(), serde_json::Value::from(payload));
    serde_json::Value::Object(msg).to_string()
}

pub fn pong_message(event_id: Option<u64>) -> String {
    serde_json::json!({
        "type": "pong",
        "event_id": event_id,
    })
    .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum AgentParseError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("message has neither `type` nor `audioChunk`")]
    Unrecognized,
}
