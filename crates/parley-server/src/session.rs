//! One websocket connection from upgrade to close.
//!
//! A session runs two loops. The read loop decodes client frames, checks them
//! against the subscriptions fixed at connect time, persists posts and hands
//! the results to the hub. The write loop drains the session's mailbox onto
//! the socket and sends keepalive pings. Whichever loop stops first takes the
//! other down with it, and the session always leaves the hub on the way out.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use parley_core::envelope::{self, BroadcastEnvelope, Inbound, Outbound};
use parley_core::gateway::PersistenceGateway;
use parley_core::{ConnectionId, ConversationId, ProtocolError, UserId};
use parley_telemetry::{names, MetricsRecorder};

use crate::config::ServerConfig;
use crate::hub::{Hub, SessionHandle};
use crate::mailbox::{self, MailboxReceiver, PushError};

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Active)
                | (Self::Connecting, Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Atomically stored [`SessionState`] that only accepts legal transitions.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Connecting as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`; returns false (and changes nothing) if illegal.
    pub fn transition(&self, next: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                SessionState::from_u8(raw)
                    .can_transition_to(next)
                    .then_some(next as u8)
            })
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Read deadline shared by the loops; every pong pushes it out by `window`.
#[derive(Debug)]
pub struct Liveness {
    origin: Instant,
    deadline_ms: AtomicU64,
    window: Duration,
}

impl Liveness {
    pub fn new(window: Duration) -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: AtomicU64::new(saturating_millis(window)),
            window,
        }
    }

    pub fn refresh(&self) {
        let deadline = self.origin.elapsed().saturating_add(self.window);
        self.deadline_ms
            .store(saturating_millis(deadline), Ordering::Release);
    }

    pub fn deadline(&self) -> Instant {
        let offset = Duration::from_millis(self.deadline_ms.load(Ordering::Acquire));
        instant_after(self.origin, offset)
    }

    #[cfg(test)]
    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `base + offset`, clamped to roughly thirty years out.
fn instant_after(base: Instant, offset: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    base.checked_add(offset.min(FAR_FUTURE)).unwrap_or(base)
}

/// Per-connection timing and queue limits.
#[derive(Clone, Copy, Debug)]
pub struct SessionTiming {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub mailbox_capacity: usize,
}

impl SessionTiming {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
            mailbox_capacity: config.mailbox_capacity,
        }
    }
}

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Hub,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub metrics: Arc<MetricsRecorder>,
    pub timing: SessionTiming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    StreamEnded,
    ReadError,
    LivenessTimeout,
    WriterStopped,
    Evicted,
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::StreamEnded => "stream_ended",
            Self::ReadError => "read_error",
            Self::LivenessTimeout => "liveness_timeout",
            Self::WriterStopped => "writer_stopped",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
}

/// Serve an upgraded websocket until it closes.
pub async fn run_session(
    socket: WebSocket,
    id: ConnectionId,
    user_id: UserId,
    subscriptions: BTreeSet<ConversationId>,
    ctx: SessionContext,
    shutdown: CancellationToken,
) {
    let (sink, stream) = socket.split();
    run_connection(sink, stream, id, user_id, subscriptions, ctx, shutdown).await;
}

/// Session body over any frame sink/stream pair.
#[instrument(skip_all, fields(connection_id = %id, user_id = %user_id))]
pub async fn run_connection<W, R, E>(
    sink: W,
    mut stream: R,
    id: ConnectionId,
    user_id: UserId,
    subscriptions: BTreeSet<ConversationId>,
    ctx: SessionContext,
    shutdown: CancellationToken,
) where
    W: Sink<WsMessage> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: Display + Send,
{
    let (mailbox, receiver) = mailbox::channel(ctx.timing.mailbox_capacity);
    let session = Arc::new(SessionHandle::new(id.clone(), user_id, subscriptions, mailbox));
    let liveness = Liveness::new(ctx.timing.pong_wait);
    let cancel = shutdown.child_token();

    ctx.hub.register(Arc::clone(&session));
    session.state().transition(SessionState::Active);
    ctx.metrics.counter_inc(names::WS_CONNECTIONS_TOTAL, &[], 1);
    ctx.metrics.gauge_inc(names::WS_SESSIONS_OPEN, &[], 1.0);
    info!(
        conversations = session.subscriptions().len(),
        "session started"
    );

    let mut writer = tokio::spawn(write_loop(sink, receiver, ctx.timing, cancel.clone()));
    let mut reason = read_loop(&mut stream, &session, &ctx, &liveness, &cancel).await;

    // A session already `Closing` here was evicted by the hub.
    let evicted = !session.state().transition(SessionState::Closing)
        && session.state().get() == SessionState::Closing;
    if reason == CloseReason::WriterStopped {
        if shutdown.is_cancelled() {
            reason = CloseReason::Shutdown;
        } else if evicted {
            reason = CloseReason::Evicted;
        }
    }
    ctx.hub.unregister(id);
    session.mailbox().close();

    // Remaining frames plus the close frame, each bounded by write_wait.
    let drain_limit = ctx.timing.write_wait.saturating_mul(2);
    if tokio::time::timeout(drain_limit, &mut writer).await.is_err() {
        warn!("writer did not finish draining, aborting");
        writer.abort();
    }

    session.state().transition(SessionState::Closed);
    ctx.metrics.gauge_inc(names::WS_SESSIONS_OPEN, &[], -1.0);
    ctx.metrics.counter_inc(names::WS_DISCONNECTIONS_TOTAL, &[("reason", reason.as_str())], 1);
    info!(reason = reason.as_str(), "session closed");
}

async fn read_loop<R, E>(
    stream: &mut R,
    session: &SessionHandle,
    ctx: &SessionContext,
    liveness: &Liveness,
    cancel: &CancellationToken,
) -> CloseReason
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::WriterStopped,
            next = tokio::time::timeout_at(liveness.deadline(), stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                warn!("no pong within deadline");
                return CloseReason::LivenessTimeout;
            }
            Ok(None) => return CloseReason::StreamEnded,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                return CloseReason::ReadError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let reply = match frame {
            WsMessage::Text(text) => handle_frame(ctx, session, text.as_str()).await,
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => handle_frame(ctx, session, text).await,
                Err(_) => Some(protocol_error(ctx, ProtocolError::InvalidFormat)),
            },
            WsMessage::Pong(_) => {
                liveness.refresh();
                None
            }
            WsMessage::Ping(_) => None,
            WsMessage::Close(_) => return CloseReason::PeerClosed,
        };

        if let Some(reply) = reply {
            push_reply(session, &reply);
        }
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut receiver: MailboxReceiver,
    timing: SessionTiming,
    cancel: CancellationToken,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let first_ping = instant_after(Instant::now(), timing.ping_period);
    let mut ping = tokio::time::interval_at(first_ping, timing.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = receiver.recv() => match frame {
                Some(payload) => {
                    let message = WsMessage::Text(payload.to_string().into());
                    if let Err(e) = send_with_deadline(&mut sink, message, timing.write_wait).await {
                        warn!(error = %e, "write failed");
                        break;
                    }
                }
                None => {
                    if let Err(e) = send_with_deadline(&mut sink, WsMessage::Close(None), timing.write_wait).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = send_with_deadline(&mut sink, WsMessage::Ping(vec![].into()), timing.write_wait).await {
                    warn!(error = %e, "ping failed");
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

async fn send_with_deadline<W>(sink: &mut W, message: WsMessage, wait: Duration) -> Result<(), WriteError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Timeout),
    }
}

/// Queue a direct reply for this session only. Replies never evict.
fn push_reply(session: &SessionHandle, reply: &Outbound) {
    let payload = match reply.to_json() {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "failed to encode reply");
            return;
        }
    };
    match session.mailbox().try_push(payload.into()) {
        Ok(()) | Err(PushError::Closed) => {}
        Err(PushError::Full) => warn!("mailbox full, dropping reply"),
    }
}

fn protocol_error(ctx: &SessionContext, err: ProtocolError) -> Outbound {
    ctx.metrics
        .counter_inc(names::PROTOCOL_ERRORS_TOTAL, &[("kind", err.error_kind())], 1);
    debug!(kind = err.error_kind(), "rejected client frame");
    Outbound::from(&err)
}

/// Process one client text frame. Returns the reply owed to the sender, if
/// any; successful posts are answered through the broadcast like everyone
/// else's.
pub async fn handle_frame(ctx: &SessionContext, session: &SessionHandle, text: &str) -> Option<Outbound> {
    let inbound = match envelope::parse_inbound(text) {
        Ok(inbound) => inbound,
        Err(err) => return Some(protocol_error(ctx, err)),
    };

    let conversation_id = inbound.conversation_id();
    if !session.is_subscribed(conversation_id) {
        return Some(protocol_error(ctx, ProtocolError::NotMember));
    }

    match inbound {
        Inbound::SendMessage { content, .. } => {
            let started = Instant::now();
            let appended = ctx
                .gateway
                .append(conversation_id, session.user_id, &content)
                .await;
            let message = match appended {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, kind = err.error_kind(), %conversation_id, "append failed");
                    let text = if err.is_client_error() {
                        err.to_string()
                    } else {
                        "failed to save message".to_owned()
                    };
                    return Some(Outbound::error(text));
                }
            };

            ctx.metrics.counter_inc(names::MESSAGES_PERSISTED_TOTAL, &[], 1);
            ctx.metrics.histogram_observe(
                names::MESSAGE_PERSIST_DURATION_MS,
                &[],
                started.elapsed().as_secs_f64() * 1000.0,
            );

            match BroadcastEnvelope::new_message(&message) {
                Ok(envelope) => {
                    ctx.hub.broadcast(envelope);
                    None
                }
                Err(e) => {
                    error!(error = %e, message_id = %message.id, "failed to encode message");
                    Some(Outbound::error("failed to deliver message"))
                }
            }
        }
        Inbound::Typing { .. } => {
            match BroadcastEnvelope::typing(conversation_id, session.user_id) {
                Ok(envelope) => ctx.hub.broadcast(envelope),
                Err(e) => error!(error = %e, "failed to encode typing event"),
            }
            None
        }
    }
}
