use axum::extract::State;
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// Handle /twilio/voice, the Twilio webhook for incoming calls.
///
/// Responds with TwiML that connects the call to a WebSocket media stream.
/// Twilio then opens a WSS connection to /twilio/media, which the relay bridges
/// to the agent.
pub async fn handle_voice(State(state): State<AppState>) -> Response {
    let ws_url = media_stream_url(&state.config.server.external_url);
    tracing::info!(stream_url = %ws_url, "Incoming call, answering with media stream");

    ([("Content-Type", "text/xml")], twiml(&ws_url)).into_response()
}

fn twiml(ws_url: &str) -> String {
    let ws_url = escape_attr(ws_url);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_url}" />
    </Connect>
</Response>"#
    )
}

/// Escape a value for use inside a double-quoted XML attribute.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

fn media_stream_url(external_url: &str) -> String {
    format!(
        "{}/twilio/media",
        external_url
            .trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    )
}
