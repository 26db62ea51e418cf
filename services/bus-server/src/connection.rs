//! `Connection` implementation over an axum websocket.
//!
//! Each accepted socket is split into a read half and a write half, each
//! driven by its own task; [`WebSocketConnection`] itself just exposes the
//! channels those tasks feed, so it can implement `Connection`'s `&self`
//! methods without needing to hold the socket directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bus_protocol::Rmsg;
use futures_util::{SinkExt, StreamExt};
use msgbus::{BusError, BusResult, Connection};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;

pub struct WebSocketConnection {
    connsid: String,
    tokens: RwLock<HashMap<String, String>>,
    inbound: Mutex<mpsc::Receiver<Rmsg>>,
    outbound: mpsc::Sender<Rmsg>,
    closed: Arc<AtomicBool>,
}

impl WebSocketConnection {
    /// Splits `socket` into reader/writer tasks and returns the
    /// `Connection` handle fed by them.
    pub fn spawn(socket: WebSocket, connsid: String) -> Arc<Self> {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Rmsg>(256);
        let closed = Arc::new(AtomicBool::new(false));

        let conn = Arc::new(Self {
            connsid: connsid.clone(),
            tokens: RwLock::new(HashMap::new()),
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            closed: closed.clone(),
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Rmsg>(&text) {
                        Ok(rmsg) => {
                            if inbound_tx.send(rmsg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(connsid, error = %e, "dropping malformed inbound frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(connsid, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
        });

        tokio::spawn(async move {
            while let Some(rmsg) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&rmsg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        conn
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn connsid(&self) -> &str {
        &self.connsid
    }

    async fn tokens(&self) -> HashMap<String, String> {
        self.tokens.read().await.clone()
    }

    async fn set_tokens(&self, tokens: HashMap<String, String>) {
        *self.tokens.write().await = tokens;
    }

    async fn recv(&self) -> BusResult<Option<Rmsg>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn send(&self, msg: &Rmsg) -> BusResult<()> {
        self.outbound
            .send(msg.clone())
            .await
            .map_err(|_| BusError::UnknownConnection(self.connsid.clone()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
