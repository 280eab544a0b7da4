use std::sync::{Arc, OnceLock};

use base64::Engine;

use crate::agent::protocol::{self, AgentEvent};
use crate::config::RelayConfig;
use crate::twilio::stream::{self, StreamEvent};

use super::frame::Frame;
use super::SessionId;

/// What a pump should do with one frame read from its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Write to this pump's sink.
    Forward(Frame),
    /// Send back towards the source connection (through the opposite pump's outbox).
    Reply(Frame),
    /// Discard. The router has already logged why.
    Drop,
    /// The source announced the end of the stream.
    End,
}

/// Per-direction translation between the caller and agent protocols.
pub trait FrameRouter: Send + 'static {
    fn route(&mut self, frame: Frame) -> Route;
}

/// How frames without a counterpart on the other side are treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Key under which caller audio is wrapped for the agent.
    pub audio_field: String,
    /// Pass caller control events (`connected`, `start`, `mark`, ...) to the agent verbatim.
    pub forward_caller_control: bool,
    /// Pass agent events with no telephony equivalent to the caller verbatim.
    pub forward_agent_events: bool,
}

impl From<&RelayConfig> for RelayPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            audio_field: config.audio_field.clone(),
            forward_caller_control: config.forward_caller_control,
            forward_agent_events: config.forward_agent_events,
        }
    }
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            audio_field: crate::config::default_audio_field(),
            forward_caller_control: false,
            forward_agent_events: false,
        }
    }
}

/// The telephony stream id, learned from the caller's `start` event.
///
/// Written once by the caller→agent pump and read by the agent→caller pump when it
/// envelopes outbound audio.
#[derive(Debug, Clone, Default)]
pub struct StreamIdentity(Arc<OnceLock<String>>);

impl StreamIdentity {
    pub fn set(&self, stream_sid: &str) -> bool {
        self.0.set(stream_sid.to_string()).is_ok()
    }

    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

/// Routes telephony frames to the agent.
pub struct CallerToAgent {
    session_id: SessionId,
    policy: Arc<RelayPolicy>,
    stream: StreamIdentity,
}

impl CallerToAgent {
    pub fn new(session_id: SessionId, policy: Arc<RelayPolicy>, stream: StreamIdentity) -> Self {
        Self {
            session_id,
            policy,
            stream,
        }
    }

    fn control(&self, name: &str, raw: String) -> Route {
        if self.policy.forward_caller_control {
            Route::Forward(Frame::Text(raw))
        } else {
            tracing::debug!(
                session_id = %self.session_id,
                event = name,
                "Dropping caller control event"
            );
            Route::Drop
        }
    }
}

impl FrameRouter for CallerToAgent {
    fn route(&mut self, frame: Frame) -> Route {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => return Route::Forward(Frame::Binary(data)),
            Frame::Close(_) => return Route::End,
        };

        let event = match StreamEvent::parse(&text) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "Dropping malformed caller frame: {e}");
                return Route::Drop;
            }
        };
        let name = event.name();
        tracing::trace!(session_id = %self.session_id, kind = %event.kind(), event = name, "Caller frame");

        match event {
            StreamEvent::Media { media } => Route::Forward(Frame::Text(
                protocol::audio_chunk_message(&self.policy.audio_field, &media.payload),
            )),
            StreamEvent::Stop { stream_sid } => {
                tracing::info!(
                    session_id = %self.session_id,
                    stream_sid = ?stream_sid,
                    "Caller stream stopped"
                );
                Route::End
            }
            StreamEvent::Start { ref start, .. } => {
                if let Some(sid) = event.started_stream_sid() {
                    if !self.stream.set(sid) {
                        tracing::warn!(
                            session_id = %self.session_id,
                            stream_sid = %sid,
                            "Ignoring repeated start event"
                        );
                    }
                }
                let meta = start.as_ref();
                let format = meta.and_then(|m| m.media_format.as_ref());
                tracing::info!(
                    session_id = %self.session_id,
                    stream_sid = ?self.stream.get(),
                    call_sid = ?meta.and_then(|m| m.call_sid.as_deref()),
                    encoding = ?format.and_then(|f| f.encoding.as_deref()),
                    sample_rate = ?format.and_then(|f| f.sample_rate),
                    channels = ?format.and_then(|f| f.channels),
                    "Caller stream started"
                );
                self.control(name, text)
            }
            StreamEvent::Connected { ref protocol } => {
                tracing::debug!(session_id = %self.session_id, protocol = ?protocol, "Caller stream connected");
                self.control(name, text)
            }
            StreamEvent::Mark { ref mark } => {
                tracing::debug!(
                    session_id = %self.session_id,
                    mark = ?mark.as_ref().and_then(|m| m.name.as_deref()),
                    "Caller playback mark"
                );
                self.control(name, text)
            }
            StreamEvent::Other => self.control(name, text),
        }
    }
}

/// Routes agent frames to the telephony side.
pub struct AgentToCaller {
    session_id: SessionId,
    policy: Arc<RelayPolicy>,
    stream: StreamIdentity,
}

impl AgentToCaller {
    pub fn new(session_id: SessionId, policy: Arc<RelayPolicy>, stream: StreamIdentity) -> Self {
        Self {
            session_id,
            policy,
            stream,
        }
    }

    /// Wrap agent audio as a Twilio `media` event. Before `start` the streamSid is
    /// unknown and the event goes out without one.
    fn media(&self, payload: &str) -> Route {
        let stream_sid = self.stream.get();
        if stream_sid.is_none() {
            tracing::debug!(session_id = %self.session_id, "Agent audio before start, sending without streamSid");
        }
        Route::Forward(Frame::Text(stream::media_message(stream_sid, payload)))
    }
}

impl FrameRouter for AgentToCaller {
    fn route(&mut self, frame: Frame) -> Route {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
                return self.media(&b64);
            }
            Frame::Close(_) => return Route::End,
        };

        let event = match AgentEvent::parse(&text) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "Dropping malformed agent frame: {e}");
                return Route::Drop;
            }
        };
        tracing::trace!(session_id = %self.session_id, kind = %event.kind(), "Agent frame");

        match event {
            AgentEvent::Audio { payload } => self.media(&payload),
            AgentEvent::Interruption => {
                tracing::debug!(session_id = %self.session_id, "Agent interrupted, clearing playback");
                Route::Forward(Frame::Text(stream::clear_message(self.stream.get())))
            }
            AgentEvent::Ping { event_id } => {
                Route::Reply(Frame::Text(protocol::pong_message(event_id)))
            }
            AgentEvent::Other { kind } => {
                if self.policy.forward_agent_events {
                    Route::Forward(Frame::Text(text))
                } else {
                    tracing::debug!(
                        session_id = %self.session_id,
                        kind = %kind,
                        "Dropping agent event with no telephony equivalent"
                    );
                    Route::Drop
                }
            }
        }
    }
}
