#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use cloudide_session::TerminalSurface;

pub const WAIT: Duration = Duration::from_secs(5);

/// In-process websocket backend. Each accepted connection becomes a
/// [`MockPeer`] the test drives by hand.
pub struct MockBackend {
    pub base_url: String,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

pub struct MockPeer {
    /// Request path and query the client connected with.
    pub path: String,
    received: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl MockBackend {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock backend")?;
        let addr = listener.local_addr()?;
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let peers_tx = peers_tx.clone();
                tokio::spawn(async move {
                    let path = Arc::new(Mutex::new(String::new()));
                    let seen = path.clone();
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        *seen.lock() = req.uri().to_string();
                        Ok(resp)
                    };
                    let Ok(ws) = accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    let (mut sink, mut stream) = ws.split();
                    let (received_tx, received_rx) = mpsc::unbounded_channel();
                    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
                    let peer = MockPeer {
                        path: path.lock().clone(),
                        received: received_rx,
                        outgoing: outgoing_tx,
                    };
                    if peers_tx.send(peer).is_err() {
                        return;
                    }
                    loop {
                        tokio::select! {
                            msg = outgoing_rx.recv() => match msg {
                                Some(msg) => {
                                    let closing = msg.is_close();
                                    if sink.send(msg).await.is_err() || closing {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            frame = stream.next() => match frame {
                                Some(Ok(msg)) if msg.is_text() || msg.is_binary() => {
                                    let _ = received_tx.send(msg);
                                }
                                Some(Ok(msg)) if msg.is_close() => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) | None => break,
                            },
                        }
                    }
                });
            }
        });

        Ok(Self {
            base_url: format!("ws://{addr}/ws"),
            peers: peers_rx,
        })
    }

    pub async fn next_peer(&mut self) -> Result<MockPeer> {
        timeout(WAIT, self.peers.recv())
            .await
            .context("timed out waiting for a client connection")?
            .context("mock backend stopped")
    }
}

impl MockPeer {
    pub async fn recv_text(&mut self) -> Result<String> {
        let msg = timeout(WAIT, self.received.recv())
            .await
            .context("timed out waiting for a client frame")?
            .context("client disconnected")?;
        match msg {
            Message::Text(text) => Ok(text.to_string()),
            other => bail!("expected text frame, got {other:?}"),
        }
    }

    pub async fn recv_json(&mut self) -> Result<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).with_context(|| format!("client sent invalid json: {text}"))
    }

    /// Fails if the client sends anything within `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) -> Result<()> {
        match timeout(quiet, self.received.recv()).await {
            Err(_) | Ok(None) => Ok(()),
            Ok(Some(msg)) => bail!("unexpected client frame: {msg:?}"),
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.outgoing.send(Message::text(text.into()));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, bytes: &[u8]) {
        let _ = self.outgoing.send(Message::binary(bytes.to_vec()));
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}

/// Surface that records every byte written to it.
#[derive(Clone, Default)]
pub struct RecordingSurface {
    pub written: Arc<Mutex<Vec<u8>>>,
}

impl RecordingSurface {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    pub async fn wait_for(&self, needle: &str) -> Result<()> {
        let start = tokio::time::Instant::now();
        while !self.text().contains(needle) {
            if start.elapsed() > WAIT {
                bail!("surface never showed {needle:?}; got {:?}", self.text());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl TerminalSurface for RecordingSurface {
    fn write(&mut self, bytes: &[u8]) {
        self.written.lock().extend_from_slice(bytes);
    }
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = tokio::time::Instant::now();
    while !check() {
        if start.elapsed() > WAIT {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
