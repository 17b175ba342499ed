use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Readiness of one connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called or the handle was dropped.
    Local,
    /// The peer sent a close frame or hung up.
    Remote,
    /// Handshake or socket failure.
    Error(String),
}

/// Frames delivered by a connection, in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Always the last item; sent exactly once.
    Closed(CloseReason),
}

pub type InboundStream = mpsc::UnboundedReceiver<Inbound>;

/// Handle to one websocket.
///
/// Architecture:
/// - `connect` returns immediately in `Connecting`.
/// - A single background task owns the socket: it performs the handshake,
///   then drains the bounded outbound queue into the sink and forwards
///   inbound frames to the [`InboundStream`].
/// - When the task exits for any reason the state flips to `Closed` and a
///   final [`Inbound::Closed`] is emitted.
pub struct Connection {
    url: String,
    outbound: mpsc::Sender<Message>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
    pub fn connect(url: impl Into<String>, outbound_queue: usize) -> (Self, InboundStream) {
        let url = url.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);

        debug!(%url, "connecting");
        tokio::spawn(run(
            url.clone(),
            outbound_rx,
            inbound_tx,
            state.clone(),
            shutdown_rx,
        ));

        let conn = Self {
            url,
            outbound: outbound_tx,
            state,
            shutdown: Mutex::new(Some(shutdown_tx)),
        };
        (conn, inbound_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves `true` once open, `false` if the connection closed first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        rx.wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state == ConnectionState::Open)
            .unwrap_or(false)
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Queue a text frame. Frames are written in call order.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.outbound
            .try_send(Message::text(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::QueueFull,
                TrySendError::Closed(_) => TransportError::ConnectionLost {
                    reason: "writer task exited".to_string(),
                },
            })
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self) {
        let Some(shutdown) = self.shutdown.lock().take() else {
            return;
        };
        advance(&self.state, ConnectionState::Closed);
        let _ = shutdown.send(());
        debug!(url = %self.url, "connection closed locally");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Move `state` forward to `next`. Returns whether it changed.
fn advance(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

async fn run(
    url: String,
    mut outbound: mpsc::Receiver<Message>,
    inbound: mpsc::UnboundedSender<Inbound>,
    state: Arc<watch::Sender<ConnectionState>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let reason = run_socket(&url, &mut outbound, &inbound, &state, &mut shutdown).await;
    match &reason {
        CloseReason::Local => {}
        CloseReason::Remote => info!(%url, "connection closed by peer"),
        CloseReason::Error(e) => warn!(%url, "connection lost: {e}"),
    }
    advance(&state, ConnectionState::Closed);
    let _ = inbound.send(Inbound::Closed(reason));
}

async fn run_socket(
    url: &str,
    outbound: &mut mpsc::Receiver<Message>,
    inbound: &mpsc::UnboundedSender<Inbound>,
    state: &watch::Sender<ConnectionState>,
    shutdown: &mut oneshot::Receiver<()>,
) -> CloseReason {
    let ws = tokio::select! {
        _ = &mut *shutdown => return CloseReason::Local,
        result = connect_async(url) => match result {
            Ok((ws, _)) => ws,
            Err(e) => return CloseReason::Error(e.to_string()),
        },
    };
    if !advance(state, ConnectionState::Open) {
        return CloseReason::Local;
    }
    info!(%url, "connection open");

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                // Frames queued before close() are still delivered.
                while let Ok(msg) = outbound.try_recv() {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return CloseReason::Local;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        return CloseReason::Error(e.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return CloseReason::Local;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(Inbound::Text(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = inbound.send(Inbound::Binary(data.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(%url, ?frame, "close frame received");
                    return CloseReason::Remote;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return CloseReason::Error(e.to_string()),
                None => return CloseReason::Remote,
            },
        }
    }
}
