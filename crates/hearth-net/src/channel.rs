//! One WebSocket connection and its lifecycle.
//!
//! A [`Channel`] only exists once the socket is `OPEN`; `IDLE` and
//! `CONNECTING` are observed through the owning slot's [`ConnectionStatus`].
//! `CLOSED` is terminal: reconnecting builds a new instance.
//!
//! Each channel runs two tasks. The writer drains an unbounded queue into the
//! socket; the reader parses text frames and hands them to the dispatcher in
//! transport order, until the socket closes or the channel is deactivated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};
use url::Url;

use hearth_shared::constants::{CLOSE_FORBIDDEN, CLOSE_SERVER_ERROR, CLOSE_UNAUTHORIZED};
use hearth_shared::{ChannelKind, ServerFrame};

use crate::endpoint::redact;
use crate::error::{ConnectFailure, TransportError};
use crate::handlers::FrameHandler;

/// Per-channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Why a channel ended up `CLOSED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this client (disconnect, replacement, drop).
    Local,
    /// The server closed the socket.
    Remote { code: Option<u16> },
    /// Socket error while connecting or open.
    Error(String),
    /// Never reached `OPEN`.
    Failed(String),
}

/// Observable status of one channel slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting(ChannelKind),
    Open(ChannelKind),
    Closed {
        kind: ChannelKind,
        reason: CloseReason,
    },
}

impl ConnectionStatus {
    pub fn state(&self) -> ChannelState {
        match self {
            Self::Idle => ChannelState::Idle,
            Self::Connecting(_) => ChannelState::Connecting,
            Self::Open(_) => ChannelState::Open,
            Self::Closed { .. } => ChannelState::Closed,
        }
    }

    pub fn kind(&self) -> Option<ChannelKind> {
        match self {
            Self::Idle => None,
            Self::Connecting(kind) | Self::Open(kind) | Self::Closed { kind, .. } => Some(*kind),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

/// Publishes status for one connection attempt, and goes quiet once a newer
/// attempt on the same slot has started.
#[derive(Clone)]
pub(crate) struct StatusPublisher {
    tx: Arc<watch::Sender<ConnectionStatus>>,
    epoch: Arc<AtomicU64>,
    mine: u64,
}

impl StatusPublisher {
    pub(crate) fn new(tx: Arc<watch::Sender<ConnectionStatus>>, epoch: Arc<AtomicU64>, mine: u64) -> Self {
        Self { tx, epoch, mine }
    }

    pub(crate) fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.mine
    }

    /// The epoch is checked under the watch lock, so a stale attempt can
    /// never overwrite a status published by a newer one.
    pub(crate) fn publish(&self, status: ConnectionStatus) {
        let (epoch, mine) = (&self.epoch, self.mine);
        self.tx.send_if_modified(move |current| {
            if epoch.load(Ordering::SeqCst) != mine {
                return false;
            }
            *current = status;
            true
        });
    }
}

struct ChannelShared {
    kind: ChannelKind,
    state: Mutex<ChannelState>,
    active: AtomicBool,
    status: StatusPublisher,
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Transition to `CLOSED`. Returns `false` if already closed.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == ChannelState::Closed {
            return false;
        }
        self.active.store(false, Ordering::SeqCst);
        *state = ChannelState::Closed;
        drop(state);

        self.status.publish(ConnectionStatus::Closed {
            kind: self.kind,
            reason,
        });
        true
    }
}

/// An open (or since closed) WebSocket connection.
pub(crate) struct Channel {
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl Channel {
    /// Open a socket to `url` and resolve once it is `OPEN`.
    pub(crate) async fn connect(
        kind: ChannelKind,
        url: &Url,
        open_grace: Duration,
        dispatch: FrameHandler,
        status: StatusPublisher,
    ) -> Result<Self, TransportError> {
        let target = redact(url);
        status.publish(ConnectionStatus::Connecting(kind));
        debug!(channel = %kind, url = %target, "connecting");

        let fail = |reason: ConnectFailure| {
            warn!(channel = %kind, url = %target, reason = %reason, "channel never opened");
            status.publish(ConnectionStatus::Closed {
                kind,
                reason: CloseReason::Failed(reason.to_string()),
            });
            TransportError::Connection {
                channel: kind,
                reason,
            }
        };

        let (ws, _response) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => return Err(fail(classify_handshake_error(e))),
        };

        let (sink, mut stream) = ws.split();

        let pending = match await_open(&mut stream, open_grace).await {
            Ok(pending) => pending,
            Err(reason) => return Err(fail(reason)),
        };

        let shared = Arc::new(ChannelShared {
            kind,
            state: Mutex::new(ChannelState::Open),
            active: AtomicBool::new(true),
            status: status.clone(),
        });
        status.publish(ConnectionStatus::Open(kind));
        info!(channel = %kind, url = %target, "channel open");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        // The writer exits once the queue is dropped or after a Close frame.
        tokio::spawn(write_loop(kind, sink, outbound_rx));
        let reader = tokio::spawn(read_loop(shared.clone(), stream, pending, dispatch));

        Ok(Self {
            shared,
            outbound,
            reader,
        })
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Queue a text frame. Fails with `NotConnected` unless `OPEN`.
    pub(crate) fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Close the channel. No frame is dispatched after this returns.
    pub(crate) fn close(&self) {
        if self.shared.mark_closed(CloseReason::Local) {
            debug!(channel = %self.shared.kind, "closing channel");
            let _ = self.outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })));
        }
        self.reader.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_handshake_error(err: WsError) -> ConnectFailure {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ConnectFailure::Unauthorized { code: status }
            } else {
                ConnectFailure::Rejected { status }
            }
        }
        other => ConnectFailure::Handshake(other.to_string()),
    }
}

/// Wait up to `grace` for the server to close right after the upgrade.
/// A data frame that arrives first is handed back for normal dispatch.
async fn await_open<S>(stream: &mut S, grace: Duration) -> Result<Option<Message>, ConnectFailure>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    if grace.is_zero() {
        return Ok(None);
    }

    match tokio::time::timeout(grace, stream.next()).await {
        Err(_elapsed) => Ok(None),
        Ok(None) => Err(ConnectFailure::ClosedBeforeOpen { code: None }),
        Ok(Some(Ok(Message::Close(frame)))) => {
            let code = frame.map(|f| u16::from(f.code));
            Err(match code {
                Some(c) if c == CLOSE_UNAUTHORIZED || c == CLOSE_FORBIDDEN => {
                    ConnectFailure::Unauthorized { code: c }
                }
                code => ConnectFailure::ClosedBeforeOpen { code },
            })
        }
        Ok(Some(Ok(message))) => Ok(Some(message)),
        Ok(Some(Err(e))) => Err(ConnectFailure::Handshake(e.to_string())),
    }
}

async fn write_loop<S>(kind: ChannelKind, mut sink: S, mut rx: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(channel = %kind, error = %e, "write failed, stopping writer");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
    trace!(channel = %kind, "writer task ended");
}

async fn read_loop<S>(
    shared: Arc<ChannelShared>,
    mut stream: S,
    mut pending: Option<Message>,
    dispatch: FrameHandler,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let kind = shared.kind;

    loop {
        let next = match pending.take() {
            Some(message) => Some(Ok(message)),
            None => stream.next().await,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if !shared.is_active() {
                    break;
                }
                match ServerFrame::parse(&text) {
                    Ok(frame) => {
                        trace!(channel = %kind, frame_type = frame.kind(), "frame received");
                        dispatch(&frame);
                    }
                    Err(e) => {
                        warn!(channel = %kind, error = %e, len = text.len(), "dropping malformed frame");
                    }
                }
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(channel = %kind, len = data.len(), "ignoring binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                if code == Some(CLOSE_SERVER_ERROR) {
                    warn!(channel = %kind, "server closed channel after an internal error");
                } else {
                    info!(channel = %kind, code = ?code, "server closed channel");
                }
                shared.mark_closed(CloseReason::Remote { code });
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let err = TransportError::Transport {
                    channel: kind,
                    message: e.to_string(),
                };
                warn!(error = %err, "channel failed");
                shared.mark_closed(CloseReason::Error(e.to_string()));
                break;
            }
            None => {
                shared.mark_closed(CloseReason::Remote { code: None });
                break;
            }
        }
    }

    trace!(channel = %kind, "reader task ended");
}
