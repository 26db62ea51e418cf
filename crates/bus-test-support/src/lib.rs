// bus-test-support: an in-memory `Connection` and small harness helpers
// for exercising `msgbus::Bus` without a real network transport.
//
// Provides a minimal `Connection` suited for integration tests,
// in-process: `in_memory_pair` wires a `Connection`
// the bus can `conn()` directly to a `PeerHandle` the test drives as if it
// were the remote peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bus_protocol::Rmsg;
use msgbus::{BusError, BusResult, Connection};
use tokio::sync::{Mutex, RwLock, mpsc};

/// A `Connection` backed by two in-process channels: one carrying
/// messages from the peer to the bus (`recv`), one carrying messages
/// from the bus to the peer (`send`). Use [`in_memory_pair`] to build one
/// alongside the [`PeerHandle`] a test drives.
pub struct InMemoryConnection {
    connsid: String,
    tokens: RwLock<HashMap<String, String>>,
    inbound: Mutex<mpsc::Receiver<Rmsg>>,
    outbound: mpsc::Sender<Rmsg>,
    closed: AtomicBool,
}

/// The peer side of an [`InMemoryConnection`]: what a test uses to act as
/// the remote end of the connection the bus accepted.
pub struct PeerHandle {
    to_bus: mpsc::Sender<Rmsg>,
    from_bus: Mutex<mpsc::Receiver<Rmsg>>,
}

impl PeerHandle {
    /// Delivers `msg` to the bus, as if the peer had sent it over the wire.
    pub async fn send_to_bus(&self, msg: Rmsg) {
        let _ = self.to_bus.send(msg).await;
    }

    /// Waits for the next message the bus sent to this peer, or `None`
    /// once the connection has been dropped.
    pub async fn recv_from_bus(&self) -> Option<Rmsg> {
        self.from_bus.lock().await.recv().await
    }
}

/// Builds a connected pair: the `Connection` side to hand to `Bus::conn`,
/// and the `PeerHandle` side a test drives to play the remote peer.
pub fn in_memory_pair(connsid: impl Into<String>) -> (Arc<InMemoryConnection>, PeerHandle) {
    let (to_bus_tx, to_bus_rx) = mpsc::channel(256);
    let (from_bus_tx, from_bus_rx) = mpsc::channel(256);

    let conn = Arc::new(InMemoryConnection {
        connsid: connsid.into(),
        tokens: RwLock::new(HashMap::new()),
        inbound: Mutex::new(to_bus_rx),
        outbound: from_bus_tx,
        closed: AtomicBool::new(false),
    });
    let peer = PeerHandle {
        to_bus: to_bus_tx,
        from_bus: Mutex::new(from_bus_rx),
    };
    (conn, peer)
}

#[async_trait]
impl Connection for InMemoryConnection {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_send_reaches_connection_recv() {
        let (conn, peer) = in_memory_pair("c1");
        peer.send_to_bus(Rmsg {
            sid: "s1".to_string(),
            lsid: None,
            bodycodeid: 0,
            body: serde_json::json!({"x": 1}),
        })
        .await;

        let received = conn.recv().await.unwrap().unwrap();
        assert_eq!(received.sid, "s1");
    }

    #[tokio::test]
    async fn connection_send_reaches_peer() {
        let (conn, peer) = in_memory_pair("c1");
        conn.send(&Rmsg {
            sid: "s2".to_string(),
            lsid: None,
            bodycodeid: 1,
            body: serde_json::Value::Null,
        })
        .await
        .unwrap();

        let received = peer.recv_from_bus().await.unwrap();
        assert_eq!(received.sid, "s2");
    }

    #[tokio::test]
    async fn close_makes_recv_return_none() {
        let (conn, _peer) = in_memory_pair("c1");
        conn.close().await;
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_round_trip() {
        let (conn, _peer) = in_memory_pair("c1");
        let mut tokens = HashMap::new();
        tokens.insert("user".to_string(), "alice".to_string());
        conn.set_tokens(tokens.clone()).await;
        assert_eq!(conn.tokens().await, tokens);
    }

    #[tokio::test]
    async fn connsid_is_stable() {
        let (conn, _peer) = in_memory_pair("stable-id");
        assert_eq!(conn.connsid(), "stable-id");
    }
}
