use axum::extract::ws::{self as axum_ws};
use bytes::Bytes;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame};

/// WebSocket limits a close reason to 123 bytes of UTF-8.
const MAX_CLOSE_REASON: usize = 123;

/// One unit of payload carried by either leg of a relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseReason>),
}

/// What a frame carries once its protocol layer has looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Media,
    Control,
    Unknown,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Media => f.write_str("media"),
            FrameKind::Control => f.write_str("control"),
            FrameKind::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut cut = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self { code, reason }
    }
}

/// Conversion between a transport's native message type and [`Frame`].
///
/// Pings and pongs are answered by the WebSocket layer itself, so they map to `None`
/// and never reach a pump's routing logic.
pub trait WireMessage: Sized + Send + 'static {
    fn into_frame(self) -> Option<Frame>;
    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for axum_ws::Message {
    fn into_frame(self) -> Option<Frame> {
        match self {
            axum_ws::Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            axum_ws::Message::Binary(data) => Some(Frame::Binary(data)),
            axum_ws::Message::Close(close) => Some(Frame::Close(close.map(|c| {
                CloseReason::new(c.code, c.reason.as_str())
            }))),
            axum_ws::Message::Ping(_) | axum_ws::Message::Pong(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => axum_ws::Message::Text(text.into()),
            Frame::Binary(data) => axum_ws::Message::Binary(data),
            Frame::Close(close) => axum_ws::Message::Close(close.map(|c| axum_ws::CloseFrame {
                code: c.code,
                reason: c.reason.into(),
            })),
        }
    }
}

impl WireMessage for tungstenite::Message {
    fn into_frame(self) -> Option<Frame> {
        match self {
            tungstenite::Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            tungstenite::Message::Binary(data) => Some(Frame::Binary(data)),
            tungstenite::Message::Close(close) => Some(Frame::Close(close.map(|c| {
                CloseReason::new(u16::from(c.code), c.reason.as_str())
            }))),
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => tungstenite::Message::Text(text.into()),
            Frame::Binary(data) => tungstenite::Message::Binary(data),
            Frame::Close(close) => tungstenite::Message::Close(close.map(|c| CloseFrame {
                code: CloseCode::from(c.code),
                reason: c.reason.into(),
            })),
        }
    }
}
