use std::fmt::Display;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{Frame, WireMessage};
use super::route::{FrameRouter, Route};
use super::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    CallerToAgent,
    AgentToCaller,
}

impl Direction {
    /// The connection this direction reads from.
    pub fn source_side(self) -> &'static str {
        match self {
            Direction::CallerToAgent => "caller",
            Direction::AgentToCaller => "agent",
        }
    }

    /// The connection this direction writes to.
    pub fn sink_side(self) -> &'static str {
        match self {
            Direction::CallerToAgent => "agent",
            Direction::AgentToCaller => "caller",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::CallerToAgent => f.write_str("caller->agent"),
            Direction::AgentToCaller => f.write_str("agent->caller"),
        }
    }
}

/// Why a pump stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The source closed or announced the end of its stream.
    SourceClosed,
    /// The session was cancelled from outside.
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub replied: u64,
    pub injected: u64,
}

/// Result of a pump run. The sink is handed back so the supervisor can close it.
pub struct PumpOutcome<K> {
    pub result: Result<PumpExit, PumpError>,
    pub sink: K,
    pub stats: PumpStats,
}

/// Unidirectional forwarder for one relay session.
///
/// Owns the write half of its destination. Besides frames read from the source it
/// drains `outbox`, which carries frames other parties want written to the same sink
/// (broadcast payloads, keep-alive replies). Replies produced by the router go to the
/// opposite pump through `replies`.
pub struct Pump<R> {
    pub direction: Direction,
    pub session_id: SessionId,
    pub router: R,
    pub outbox: mpsc::Receiver<Frame>,
    pub replies: mpsc::Sender<Frame>,
    pub cancel: CancellationToken,
    /// Upper bound on a single sink write. A peer that stops reading fails the pump.
    pub write_timeout: Duration,
}

/// Outcome of one bounded write.
enum Written {
    Done,
    Cancelled,
}

/// Write `msg` to `sink`, giving up after `limit` or as soon as `cancel` fires.
async fn write_bounded<K, N>(
    sink: &mut K,
    msg: N,
    cancel: &CancellationToken,
    limit: Duration,
    direction: Direction,
) -> Result<Written, PumpError>
where
    K: Sink<N> + Unpin,
    K::Error: Display,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Ok(Written::Cancelled),

        res = tokio::time::timeout(limit, sink.send(msg)) => match res {
            Ok(Ok(())) => Ok(Written::Done),
            Ok(Err(e)) => Err(PumpError::Write { direction, reason: e.to_string() }),
            Err(_) => Err(PumpError::Write {
                direction,
                reason: format!(
                    "{} not reading, write timed out after {}ms",
                    direction.sink_side(),
                    limit.as_millis()
                ),
            }),
        },
    }
}

impl<R: FrameRouter> Pump<R> {
    pub async fn run<S, M, E, K, N>(self, mut source: S, mut sink: K) -> PumpOutcome<K>
    where
        S: Stream<Item = Result<M, E>> + Unpin,
        M: WireMessage,
        E: Display,
        K: Sink<N> + Unpin,
        K::Error: Display,
        N: WireMessage,
    {
        let Pump {
            direction,
            session_id,
            mut router,
            mut outbox,
            replies,
            cancel,
            write_timeout,
        } = self;
        let mut stats = PumpStats::default();

        tracing::debug!(session_id = %session_id, %direction, "Pump started");

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(PumpExit::Cancelled),

                Some(frame) = outbox.recv() => {
                    let msg = N::from_frame(frame);
                    match write_bounded(&mut sink, msg, &cancel, write_timeout, direction).await {
                        Ok(Written::Done) => stats.injected += 1,
                        Ok(Written::Cancelled) => break Ok(PumpExit::Cancelled),
                        Err(e) => break Err(e),
                    }
                }

                next = source.next() => {
                    let frame = match next {
                        None => break Ok(PumpExit::SourceClosed),
                        Some(Err(e)) => {
                            break Err(PumpError::Read { direction, reason: e.to_string() });
                        }
                        Some(Ok(msg)) => match msg.into_frame() {
                            Some(frame) => frame,
                            None => continue,
                        },
                    };

                    if let Frame::Close(ref close) = frame {
                        tracing::info!(
                            session_id = %session_id,
                            %direction,
                            code = close.as_ref().map(|c| c.code),
                            reason = close.as_ref().map(|c| c.reason.as_str()).unwrap_or(""),
                            "{} sent close", direction.source_side()
                        );
                        break Ok(PumpExit::SourceClosed);
                    }

                    match router.route(frame) {
                        Route::Forward(out) => {
                            let msg = N::from_frame(out);
                            match write_bounded(&mut sink, msg, &cancel, write_timeout, direction).await {
                                Ok(Written::Done) => stats.forwarded += 1,
                                Ok(Written::Cancelled) => break Ok(PumpExit::Cancelled),
                                Err(e) => break Err(e),
                            }
                        }
                        Route::Reply(out) => match replies.try_send(out) {
                            Ok(()) => stats.replied += 1,
                            Err(e) => {
                                tracing::debug!(session_id = %session_id, %direction, "Reply not queued: {e}");
                                stats.dropped += 1;
                            }
                        },
                        Route::Drop => stats.dropped += 1,
                        Route::End => break Ok(PumpExit::SourceClosed),
                    }
                }
            }
        };

        match &result {
            Ok(exit) => tracing::info!(
                session_id = %session_id,
                %direction,
                exit = ?exit,
                forwarded = stats.forwarded,
                dropped = stats.dropped,
                replied = stats.replied,
                injected = stats.injected,
                "Pump finished"
            ),
            Err(e) => tracing::warn!(
                session_id = %session_id,
                %direction,
                forwarded = stats.forwarded,
                dropped = stats.dropped,
                "Pump failed: {e}"
            ),
        }

        PumpOutcome {
            result,
            sink,
            stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PumpError {
    #[error("{direction}: reading from {} failed: {reason}", direction.source_side())]
    Read { direction: Direction, reason: String },
    #[error("{direction}: writing to {} failed: {reason}", direction.sink_side())]
    Write { direction: Direction, reason: String },
}

impl PumpError {
    pub fn direction(&self) -> Direction {
        match self {
            PumpError::Read { direction, .. } | PumpError::Write { direction, .. } => *direction,
        }
    }
}
