use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::StreamExt;

use crate::AppState;

/// WebSocket upgrade handler for GET /twilio/media.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state))
}

/// Hand the accepted media stream to the relay.
///
/// The relay owns both halves from here on; the session runs in the background and
/// closes this socket when either side hangs up.
async fn handle_media_stream(socket: WebSocket, state: AppState) {
    let (tx, rx) = socket.split();
    let session_id = state.relay.start_session(rx, tx);
    tracing::info!(session_id = %session_id, "Media stream connected");
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use axum::Router;
    use futures::SinkExt;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::testing::{app_state_for, spawn_agent_mock, AgentMockEvent, MockBehavior, WAIT};

    fn json(msg: &Message) -> serde_json::Value {
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn media_endpoint_relays_a_call_end_to_end() {
        let mut mock = spawn_agent_mock(MockBehavior::Accept).await;
        let state = app_state_for(&mock.url);
        let relay = state.relay.clone();
        let app = Router::new()
            .route("/twilio/media", get(handle_media_upgrade))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut call, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/twilio/media"))
            .await
            .unwrap();
        assert!(matches!(mock.next_event().await, AgentMockEvent::Connected { .. }));

        call.send(Message::Text(
            r#"{"event":"start","streamSid":"MZ1","start":{"streamSid":"MZ1","callSid":"CA1"}}"#.into(),
        ))
        .await
        .unwrap();
        call.send(Message::Text(
            r#"{"event":"media","streamSid":"MZ1","media":{"payload":"AAAA"}}"#.into(),
        ))
        .await
        .unwrap();
        assert_eq!(json(&mock.next_frame().await)["user_audio_chunk"], "AAAA");

        mock.send(Message::Text(r#"{"audioChunk":"BBBB"}"#.into()));
        let reply = timeout(WAIT, call.next()).await.unwrap().unwrap().unwrap();
        let reply = json(&reply);
        assert_eq!(reply["event"], "media");
        assert_eq!(reply["streamSid"], "MZ1");
        assert_eq!(reply["media"]["payload"], "BBBB");

        call.close(None).await.unwrap();
        mock.expect_closed().await;
        timeout(WAIT, async {
            while !relay.registry().is_empty().await {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session still registered after the call closed");
    }
}
