use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use tokio_tungstenite::tungstenite::Message;

use crate::agent::connector::{AgentConnector, AgentSocket, ConnectError};
use crate::config::Config;
use crate::registry::{SessionEntry, SessionRegistry};

use super::frame::{CloseReason, Frame, WireMessage};
use super::pump::{Direction, Pump, PumpError, PumpExit, PumpOutcome};
use super::route::{AgentToCaller, CallerToAgent, RelayPolicy, StreamIdentity};
use super::{SessionId, SessionState};

/// Per-session knobs, resolved once from config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: Arc<RelayPolicy>,
    pub outbox_capacity: usize,
    pub teardown_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_retries: u32,
    pub retry_backoff: Duration,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            policy: Arc::new(RelayPolicy::from(&config.relay)),
            outbox_capacity: config.relay.outbox_capacity.max(1),
            teardown_timeout: Duration::from_millis(config.relay.teardown_timeout_ms),
            write_timeout: Duration::from_millis(config.relay.write_timeout_ms),
            connect_retries: config.agent.connect_retries,
            retry_backoff: Duration::from_millis(config.agent.retry_backoff_ms),
        }
    }
}

/// Why a session ended. The first termination observed wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    CallerHungUp,
    AgentHungUp,
    ConnectFailed(ConnectError),
    PumpFailed(PumpError),
    Shutdown,
    /// A pump task panicked or the session could not be registered.
    Internal(String),
}

impl TerminationCause {
    /// Close frame sent to the caller leg.
    pub fn caller_close(&self) -> CloseReason {
        match self {
            TerminationCause::CallerHungUp => CloseReason::new(CloseReason::NORMAL, "call ended"),
            TerminationCause::AgentHungUp => {
                CloseReason::new(CloseReason::NORMAL, "agent ended the conversation")
            }
            TerminationCause::ConnectFailed(e) => CloseReason::new(
                CloseReason::INTERNAL_ERROR,
                format!("upstream connect failed ({})", e.reason()),
            ),
            TerminationCause::PumpFailed(e) => CloseReason::new(
                CloseReason::INTERNAL_ERROR,
                format!("relay error ({})", e.direction()),
            ),
            TerminationCause::Shutdown => {
                CloseReason::new(CloseReason::GOING_AWAY, "server shutting down")
            }
            TerminationCause::Internal(_) => {
                CloseReason::new(CloseReason::INTERNAL_ERROR, "relay error")
            }
        }
    }

    /// Close frame sent to the agent leg.
    pub fn agent_close(&self) -> CloseReason {
        match self {
            TerminationCause::Shutdown => {
                CloseReason::new(CloseReason::GOING_AWAY, "server shutting down")
            }
            _ => CloseReason::new(CloseReason::NORMAL, "call ended"),
        }
    }

    fn from_outcome(direction: Direction, result: &Result<PumpExit, PumpError>) -> Self {
        match (direction, result) {
            (Direction::CallerToAgent, Ok(PumpExit::SourceClosed)) => TerminationCause::CallerHungUp,
            (Direction::AgentToCaller, Ok(PumpExit::SourceClosed)) => TerminationCause::AgentHungUp,
            (_, Ok(PumpExit::Cancelled)) => TerminationCause::Shutdown,
            (_, Err(e)) => TerminationCause::PumpFailed(e.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub cause: TerminationCause,
    pub reached_active: bool,
}

type AgentSink = futures::stream::SplitSink<AgentSocket, Message>;

enum FirstExit<A, C> {
    ToAgent(Result<PumpOutcome<A>, JoinError>),
    ToCaller(Result<PumpOutcome<C>, JoinError>),
}

/// Owns one session's lifecycle, from connect to deregistration.
pub struct Supervisor {
    id: SessionId,
    registry: SessionRegistry,
    connector: Arc<AgentConnector>,
    settings: Arc<SessionSettings>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl Supervisor {
    pub fn new(
        id: SessionId,
        registry: SessionRegistry,
        connector: Arc<AgentConnector>,
        settings: Arc<SessionSettings>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id,
            registry,
            connector,
            settings,
            cancel,
            state,
        }
    }

    fn transition(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        tracing::info!(session_id = %self.id, from = ?prev, to = ?next, "Session state changed");
    }

    pub async fn run<Rx, Tx, M, E>(self, inbound_rx: Rx, mut inbound_tx: Tx) -> SessionSummary
    where
        Rx: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
        M: WireMessage,
        E: Display + Send + 'static,
        Tx: Sink<M> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
    {
        let (caller_outbox_tx, caller_outbox_rx) = mpsc::channel(self.settings.outbox_capacity);
        let (agent_outbox_tx, agent_outbox_rx) = mpsc::channel(self.settings.outbox_capacity);

        let entry = SessionEntry::new(
            self.id.clone(),
            self.state.subscribe(),
            caller_outbox_tx.clone(),
        );
        if let Err(e) = self.registry.register(entry).await {
            let cause = TerminationCause::Internal(e.to_string());
            self.transition(SessionState::Closing);
            close_sink::<_, M>(&mut inbound_tx, cause.caller_close(), self.settings.teardown_timeout)
                .await;
            self.transition(SessionState::Closed);
            return self.summary(cause, false);
        }

        let socket = match self.connect_agent().await {
            Ok(socket) => socket,
            Err(cause) => {
                tracing::warn!(session_id = %self.id, cause = ?cause, "Agent connection failed");
                self.transition(SessionState::Closing);
                close_sink::<_, M>(
                    &mut inbound_tx,
                    cause.caller_close(),
                    self.settings.teardown_timeout,
                )
                .await;
                return self.finish(cause, false).await;
            }
        };
        let (agent_tx, agent_rx) = socket.split();

        self.transition(SessionState::Active);

        let stream = StreamIdentity::default();
        let to_agent = Pump {
            direction: Direction::CallerToAgent,
            session_id: self.id.clone(),
            router: CallerToAgent::new(
                self.id.clone(),
                Arc::clone(&self.settings.policy),
                stream.clone(),
            ),
            outbox: agent_outbox_rx,
            replies: caller_outbox_tx,
            cancel: self.cancel.clone(),
            write_timeout: self.settings.write_timeout,
        };
        let to_caller = Pump {
            direction: Direction::AgentToCaller,
            session_id: self.id.clone(),
            router: AgentToCaller::new(self.id.clone(), Arc::clone(&self.settings.policy), stream),
            outbox: caller_outbox_rx,
            replies: agent_outbox_tx,
            cancel: self.cancel.clone(),
            write_timeout: self.settings.write_timeout,
        };

        let mut to_agent: JoinHandle<PumpOutcome<AgentSink>> =
            tokio::spawn(to_agent.run::<_, _, _, _, Message>(inbound_rx, agent_tx));
        let mut to_caller: JoinHandle<PumpOutcome<Tx>> =
            tokio::spawn(to_caller.run::<_, _, _, _, M>(agent_rx, inbound_tx));

        let first = tokio::select! {
            res = &mut to_agent => FirstExit::ToAgent(res),
            res = &mut to_caller => FirstExit::ToCaller(res),
        };

        self.transition(SessionState::Closing);
        self.cancel.cancel();

        let (cause, agent_done, caller_done) = match first {
            FirstExit::ToAgent(res) => {
                let (cause, done) = self.first_outcome(Direction::CallerToAgent, res);
                let other = self.join_within(Direction::AgentToCaller, &mut to_caller).await;
                (cause, done, other)
            }
            FirstExit::ToCaller(res) => {
                let (cause, done) = self.first_outcome(Direction::AgentToCaller, res);
                let other = self.join_within(Direction::CallerToAgent, &mut to_agent).await;
                (cause, other, done)
            }
        };

        let timeout = self.settings.teardown_timeout;
        let agent_close = cause.agent_close();
        let caller_close = cause.caller_close();
        tokio::join!(
            async move {
                if let Some(mut done) = agent_done {
                    close_sink::<_, Message>(&mut done.sink, agent_close, timeout).await;
                }
            },
            async move {
                if let Some(mut done) = caller_done {
                    close_sink::<_, M>(&mut done.sink, caller_close, timeout).await;
                }
            },
        );

        self.finish(cause, true).await
    }

    /// Connect to the agent, retrying per settings. Cancellation aborts the attempt.
    async fn connect_agent(&self) -> Result<AgentSocket, TerminationCause> {
        let attempts = self.settings.connect_retries + 1;
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TerminationCause::Shutdown),
                r = self.connector.connect() => r,
            };
            match result {
                Ok(socket) => {
                    tracing::info!(
                        session_id = %self.id,
                        attempt,
                        "Connected to agent"
                    );
                    return Ok(socket);
                }
                Err(e) if attempt < attempts && e.is_retryable() => {
                    let backoff = self.settings.retry_backoff * attempt;
                    tracing::warn!(
                        session_id = %self.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Agent connect failed, retrying: {e}"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TerminationCause::Shutdown),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(TerminationCause::ConnectFailed(e)),
            }
        }
    }

    fn first_outcome<K>(
        &self,
        direction: Direction,
        res: Result<PumpOutcome<K>, JoinError>,
    ) -> (TerminationCause, Option<PumpOutcome<K>>) {
        match res {
            Ok(outcome) => {
                let cause = TerminationCause::from_outcome(direction, &outcome.result);
                tracing::info!(
                    session_id = %self.id,
                    %direction,
                    cause = ?cause,
                    forwarded = outcome.stats.forwarded,
                    dropped = outcome.stats.dropped,
                    "First pump finished, tearing down"
                );
                (cause, Some(outcome))
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, %direction, "Pump task failed: {e}");
                (TerminationCause::Internal(e.to_string()), None)
            }
        }
    }

    /// Wait for the second pump to observe cancellation, aborting it if it overstays.
    async fn join_within<K>(
        &self,
        direction: Direction,
        handle: &mut JoinHandle<PumpOutcome<K>>,
    ) -> Option<PumpOutcome<K>> {
        match tokio::time::timeout(self.settings.teardown_timeout, &mut *handle).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                tracing::error!(session_id = %self.id, %direction, "Pump task failed: {e}");
                None
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    %direction,
                    "Pump did not stop within {}ms, aborting",
                    self.settings.teardown_timeout.as_millis()
                );
                handle.abort();
                None
            }
        }
    }

    async fn finish(&self, cause: TerminationCause, reached_active: bool) -> SessionSummary {
        self.registry.deregister(&self.id).await;
        self.transition(SessionState::Closed);
        tracing::info!(session_id = %self.id, cause = ?cause, "Session closed");
        self.summary(cause, reached_active)
    }

    fn summary(&self, cause: TerminationCause, reached_active: bool) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            cause,
            reached_active,
        }
    }
}

/// Send a close frame and shut the sink, bounded by `timeout`. Failures are expected
/// when the peer is already gone and are only logged.
async fn close_sink<K, N>(sink: &mut K, reason: CloseReason, timeout: Duration)
where
    K: Sink<N> + Unpin,
    K::Error: Display,
    N: WireMessage,
{
    let result = tokio::time::timeout(timeout, async {
        sink.send(N::from_frame(Frame::Close(Some(reason)))).await?;
        sink.close().await
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Close not delivered: {e}"),
        Err(_) => tracing::debug!("Close timed out"),
    }
}
