//! Per-call relay between a telephony media stream and the conversational agent.
//!
//! Each call becomes a session: the [`session::Supervisor`] connects to the agent, runs a
//! [`pump::Pump`] in each direction and tears both legs down exactly once.

pub mod frame;
pub mod pump;
pub mod route;
pub mod session;

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, Stream};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::connector::AgentConnector;
use crate::registry::{BroadcastReport, SessionRegistry};
use frame::{Frame, WireMessage};
use session::{SessionSettings, SessionSummary, Supervisor};

/// Opaque id of a relay session, unique while the session is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// 16 hex chars of randomness.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 8] = rng.gen();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a relay session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Entry point for the HTTP layer: starts sessions and fans payloads out to them.
#[derive(Clone)]
pub struct Relay {
    registry: SessionRegistry,
    connector: Arc<AgentConnector>,
    settings: Arc<SessionSettings>,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(
        connector: AgentConnector,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            connector: Arc::new(connector),
            settings: Arc::new(settings),
            shutdown,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Bridge a freshly accepted caller connection, running the session in the background.
    pub fn start_session<Rx, Tx, M, E>(&self, inbound_rx: Rx, inbound_tx: Tx) -> SessionId
    where
        Rx: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
        M: WireMessage,
        E: Display + Send + 'static,
        Tx: Sink<M> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
    {
        let id = SessionId::generate();
        let relay = self.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            let summary = relay.run_session(session_id, inbound_rx, inbound_tx).await;
            tracing::debug!(
                session_id = %summary.id,
                reached_active = summary.reached_active,
                cause = ?summary.cause,
                "Session task finished"
            );
        });
        id
    }

    /// Run a session to completion on the current task.
    pub async fn run_session<Rx, Tx, M, E>(
        &self,
        id: SessionId,
        inbound_rx: Rx,
        inbound_tx: Tx,
    ) -> SessionSummary
    where
        Rx: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
        M: WireMessage,
        E: Display + Send + 'static,
        Tx: Sink<M> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
    {
        Supervisor::new(
            id,
            self.registry.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.settings),
            self.shutdown.child_token(),
        )
        .run(inbound_rx, inbound_tx)
        .await
    }

    /// Deliver an externally posted payload to the caller leg of every active session.
    pub async fn broadcast(&self, payload: &serde_json::Value) -> BroadcastReport {
        self.registry
            .broadcast(Frame::Text(payload.to_string()))
            .await
    }
}
