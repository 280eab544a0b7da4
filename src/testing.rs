//! Shared fixtures for tests: a scriptable agent WebSocket server and an in-memory
//! caller leg.

use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, HeaderMap};
use tokio_tungstenite::tungstenite::Message;

use tokio_util::sync::CancellationToken;

use crate::agent::connector::AgentConnector;
use crate::config::{AgentConfig, Config, CredentialMode};
use crate::relay::Relay;
use crate::relay::route::RelayPolicy;
use crate::relay::session::SessionSettings;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
    /// Complete the handshake and relay frames.
    Accept,
    /// Answer every handshake with this HTTP status.
    Reject(u16),
    /// Accept TCP but never answer the handshake.
    Stall,
    /// Complete the handshake, then never read another frame.
    Deaf,
}

#[derive(Debug)]
pub enum AgentMockEvent {
    Connected { headers: HeaderMap },
    Rejected,
    Frame(Message),
    Closed,
}

pub struct AgentMock {
    pub url: String,
    events: mpsc::UnboundedReceiver<AgentMockEvent>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl AgentMock {
    pub async fn next_event(&mut self) -> AgentMockEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for the agent mock")
            .expect("agent mock stopped")
    }

    /// Next frame the agent received, skipping nothing.
    pub async fn next_frame(&mut self) -> Message {
        match self.next_event().await {
            AgentMockEvent::Frame(msg) => msg,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    pub async fn expect_closed(&mut self) {
        loop {
            match self.next_event().await {
                AgentMockEvent::Closed => return,
                AgentMockEvent::Frame(_) => continue,
                other => panic!("expected close, got {other:?}"),
            }
        }
    }

    pub fn send(&self, msg: Message) {
        self.outgoing.send(msg).expect("agent mock stopped");
    }

    /// Next event without a deadline, for asserting that nothing happens.
    pub async fn next_event_raw(&mut self) -> Option<AgentMockEvent> {
        self.events.recv().await
    }
}

pub async fn spawn_agent_mock(behavior: MockBehavior) -> AgentMock {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/agent", listener.local_addr().unwrap());
    let (events_tx, events) = mpsc::unbounded_channel();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let mut stalled = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            match behavior {
                MockBehavior::Stall => stalled.push(stream),
                MockBehavior::Deaf => {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    let _ = events_tx.send(AgentMockEvent::Connected {
                        headers: HeaderMap::new(),
                    });
                    // Hold the socket open without polling it
                    let _held = ws;
                    std::future::pending::<()>().await;
                }
                MockBehavior::Reject(status) => {
                    let reject = move |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                        Err(http::Response::builder()
                            .status(status)
                            .body(Some("rejected".to_string()))
                            .unwrap())
                    };
                    let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
                    let _ = events_tx.send(AgentMockEvent::Rejected);
                }
                MockBehavior::Accept => {
                    let (headers_tx, headers_rx) = oneshot::channel();
                    let capture = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = headers_tx.send(req.headers().clone());
                        Ok(resp)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, capture).await else {
                        continue;
                    };
                    let headers = headers_rx.await.unwrap_or_default();
                    let _ = events_tx.send(AgentMockEvent::Connected { headers });

                    loop {
                        tokio::select! {
                            msg = ws.next() => match msg {
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                                    let _ = events_tx.send(AgentMockEvent::Closed);
                                    break;
                                }
                                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                                Some(Ok(msg)) => {
                                    let _ = events_tx.send(AgentMockEvent::Frame(msg));
                                }
                            },
                            Some(msg) = outgoing_rx.recv() => {
                                if ws.send(msg).await.is_err() {
                                    let _ = events_tx.send(AgentMockEvent::Closed);
                                    break;
                                }
                            }
                        }
                    }
                    // One conversation per mock
                    return;
                }
            }
        }
    });

    AgentMock {
        url,
        events,
        outgoing,
    }
}

pub fn agent_config(url: &str) -> AgentConfig {
    AgentConfig {
        url_template: url.to_string(),
        agent_id: "test-agent".to_string(),
        api_key: "sk_test".to_string(),
        credential_header: "xi-api-key".to_string(),
        credential_mode: CredentialMode::Header,
        signed_url_endpoint: String::new(),
        connect_timeout_ms: 2_000,
        connect_retries: 0,
        retry_backoff_ms: 10,
    }
}

pub fn session_settings() -> SessionSettings {
    SessionSettings {
        policy: std::sync::Arc::new(RelayPolicy::default()),
        outbox_capacity: 16,
        teardown_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_millis(500),
        connect_retries: 0,
        retry_backoff: Duration::from_millis(10),
    }
}

/// Handler state around the example config, with no sessions.
pub fn app_state() -> crate::AppState {
    let config = Config::from_toml(include_str!("../config.example.toml")).unwrap();
    state_with(config)
}

/// Handler state whose sessions connect to the agent at `agent_url`.
pub fn app_state_for(agent_url: &str) -> crate::AppState {
    let mut config = Config::from_toml(include_str!("../config.example.toml")).unwrap();
    config.agent = agent_config(agent_url);
    state_with(config)
}

fn state_with(config: Config) -> crate::AppState {
    let connector = AgentConnector::from_config(&config.agent).unwrap();
    let relay = Relay::new(connector, session_settings(), CancellationToken::new());
    crate::AppState { config, relay }
}

/// The test's end of an in-memory caller connection.
pub struct CallerLeg {
    pub to_relay: fmpsc::UnboundedSender<Result<Message, String>>,
    pub from_relay: fmpsc::UnboundedReceiver<Message>,
}

/// The relay's end: a frame stream and a sink, like a split WebSocket.
pub type RelaySide = (
    fmpsc::UnboundedReceiver<Result<Message, String>>,
    fmpsc::UnboundedSender<Message>,
);

pub fn caller_leg() -> (CallerLeg, RelaySide) {
    let (to_relay, relay_rx) = fmpsc::unbounded();
    let (relay_tx, from_relay) = fmpsc::unbounded();
    (
        CallerLeg {
            to_relay,
            from_relay,
        },
        (relay_rx, relay_tx),
    )
}

impl CallerLeg {
    pub fn send_text(&self, text: &str) {
        self.to_relay
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .expect("relay stopped reading");
    }

    pub fn send_media(&self, payload: &str) {
        self.send_text(&format!(
            r#"{{"event":"media","streamSid":"MZtest","media":{{"payload":"{payload}"}}}}"#
        ));
    }

    pub fn send_start(&self, stream_sid: &str) {
        self.send_text(&format!(
            r#"{{"event":"start","streamSid":"{stream_sid}","start":{{"streamSid":"{stream_sid}","callSid":"CAtest"}}}}"#
        ));
    }

    /// Hang up: the relay sees the end of the stream.
    pub fn hang_up(&mut self) {
        self.to_relay.close_channel();
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.from_relay.next())
            .await
            .expect("timed out waiting for the relay")
    }

    /// Skip frames until the relay closes the caller connection; returns the close frame.
    pub async fn expect_closed(&mut self) -> Option<Message> {
        let mut close = None;
        while let Some(msg) = self.next_message().await {
            if matches!(msg, Message::Close(_)) {
                close = Some(msg);
            }
        }
        close
    }

    /// Fail the caller connection with a transport error.
    pub fn send_error(&self, reason: &str) {
        let _ = self.to_relay.unbounded_send(Err(reason.to_string()));
    }
}
