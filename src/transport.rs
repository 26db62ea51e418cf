use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bus_protocol::Rmsg;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::Connection;

/// A best-effort side-channel observer. Implementors must not panic --
/// callers invoke it in the hot path of the worker loop and a panic would
/// take the whole transport down with it. Mirrors the source's
/// `on_send`/`on_recv` hooks, which absorb exceptions.
pub type Observer = Arc<dyn Fn(&str, &Rmsg) + Send + Sync>;

/// Static configuration for one transport.
///
/// `conn_type` is the connection kind this transport serves (e.g.
/// `"websocket"`, `"udp"`) and doubles as the active-transport table's key:
/// exactly one active transport exists per kind, so
/// registering a second config under the same `conn_type` is dropped with
/// a warning rather than replacing the first (`Bus::reg_transport`).
///
/// `is_server` distinguishes transports that accept inbound connections
/// (and therefore get to call `Bus::conn`) from passive/client transports.
/// A non-server transport is valid to register but is never the target of
/// `Bus::conn` — callers that try anyway get a logged skip, not an error
/// (see `Bus::conn`).
#[derive(Clone)]
pub struct TransportConfig {
    pub conn_type: String,
    pub is_server: bool,
    /// `protocol`/`host`/`port`/`route` are informational URL parts a
    /// concrete transport (e.g. the websocket demo in `services/bus-server`)
    /// uses to construct its listen address; the engine itself never reads
    /// them.
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub route: Option<String>,
    /// `0` means unbounded (spec §6: "`≤0` means unbounded" -- `usize`
    /// cannot represent a negative cap, so `0` is the sentinel).
    pub max_inp_queue_size: usize,
    /// `0` means unbounded, same as `max_inp_queue_size`.
    pub max_out_queue_size: usize,
    /// `None` disables the per-read inactivity timeout.
    pub inactivity_timeout: Option<Duration>,
    /// Informational upper bound on a single wire message's size, for
    /// fragmenting transports. Not enforced by the engine.
    pub mtu: Option<usize>,
    pub on_send: Option<Observer>,
    pub on_recv: Option<Observer>,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("conn_type", &self.conn_type)
            .field("is_server", &self.is_server)
            .field("max_inp_queue_size", &self.max_inp_queue_size)
            .field("max_out_queue_size", &self.max_out_queue_size)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .finish_non_exhaustive()
    }
}

impl TransportConfig {
    pub fn server(conn_type: impl Into<String>) -> Self {
        Self {
            conn_type: conn_type.into(),
            is_server: true,
            protocol: None,
            host: None,
            port: None,
            route: None,
            max_inp_queue_size: 256,
            max_out_queue_size: 256,
            inactivity_timeout: None,
            mtu: None,
            on_send: None,
            on_recv: None,
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_queue_caps(mut self, inbound: usize, outbound: usize) -> Self {
        self.max_inp_queue_size = inbound;
        self.max_out_queue_size = outbound;
        self
    }

    pub fn with_on_send(mut self, hook: Observer) -> Self {
        self.on_send = Some(hook);
        self
    }

    pub fn with_on_recv(mut self, hook: Observer) -> Self {
        self.on_recv = Some(hook);
        self
    }
}

type ConnTable = Arc<RwLock<HashMap<String, Arc<dyn Connection>>>>;

/// A queue sender that is either bounded or unbounded, depending on
/// whether its configured cap was `0`. Keeping both variants behind one
/// type lets `ActiveTransport` hold a single field per direction instead
/// of branching at every call site.
enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> QueueSender<T> {
    /// Sends `item`, waiting for room if the queue is bounded and full.
    /// An unbounded queue never waits.
    async fn send_blocking(&self, item: T) -> Result<(), ()> {
        match self {
            Self::Bounded(tx) => tx.send(item).await.map_err(|_| ()),
            Self::Unbounded(tx) => tx.send(item).map_err(|_| ()),
        }
    }

    /// Sends `item` without waiting, failing if a bounded queue is full.
    /// An unbounded queue never fails this way.
    fn try_send(&self, item: T) -> Result<(), ()> {
        match self {
            Self::Bounded(tx) => tx.try_send(item).map_err(|_| ()),
            Self::Unbounded(tx) => tx.send(item).map_err(|_| ()),
        }
    }
}

enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Builds a queue sender/receiver pair honoring the `0`-means-unbounded
/// convention documented on `TransportConfig`'s queue cap fields.
fn make_queue<T: Send + 'static>(cap: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    if cap == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(cap);
        (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
    }
}

/// One inbound envelope, tagged with the connection and transport it
/// arrived on, as handed off to the bus's single dispatch queue.
pub struct InboundEnvelope {
    pub conn_type: String,
    pub connsid: String,
    pub rmsg: Rmsg,
}

/// A transport with its two long-running worker tasks.
///
/// The inbound queue is fed by each connection's own read-loop task and
/// drained by `inbound_worker`, which calls the configured `on_recv`
/// observer and forwards every envelope into the bus's single dispatch
/// queue (`dispatch_tx`) so that the entire bus, across every transport,
/// processes inbound messages through one logical executor. Backpressure
/// on this path blocks the sender — a slow bus naturally slows down the
/// reader loops feeding it (a blocking put).
///
/// The outbound queue is fed by the bus's publish path and drained by
/// `outbound_worker`, which calls `on_send` then looks the destination
/// connection up in the shared connection table and calls
/// `Connection::send`. Backpressure on this path drops the message (with a
/// warning) rather than blocking the publisher — an unresponsive
/// connection must not stall the bus (a non-blocking put).
pub struct ActiveTransport {
    pub config: TransportConfig,
    inbound_tx: QueueSender<(String, Rmsg)>,
    outbound_tx: QueueSender<(String, Rmsg)>,
    _inbound_worker: JoinHandle<()>,
    _outbound_worker: JoinHandle<()>,
}

impl ActiveTransport {
    pub fn spawn(
        config: TransportConfig,
        conns: ConnTable,
        dispatch_tx: mpsc::Sender<InboundEnvelope>,
    ) -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) =
            make_queue::<(String, Rmsg)>(config.max_inp_queue_size);
        let (outbound_tx, mut outbound_rx) =
            make_queue::<(String, Rmsg)>(config.max_out_queue_size);

        let conn_type = config.conn_type.clone();
        let on_recv = config.on_recv.clone();
        let inbound_worker = tokio::spawn(async move {
            while let Some((connsid, rmsg)) = inbound_rx.recv().await {
                if let Some(hook) = &on_recv {
                    hook(&connsid, &rmsg);
                }
                let envelope = InboundEnvelope {
                    conn_type: conn_type.clone(),
                    connsid,
                    rmsg,
                };
                if dispatch_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        let on_send = config.on_send.clone();
        let outbound_worker = tokio::spawn(async move {
            while let Some((connsid, rmsg)) = outbound_rx.recv().await {
                if let Some(hook) = &on_send {
                    hook(&connsid, &rmsg);
                }
                let conn = conns.read().await.get(&connsid).cloned();
                match conn {
                    Some(conn) => {
                        if let Err(err) = conn.send(&rmsg).await {
                            warn!(connsid, error = %err, "failed to deliver outbound message");
                        }
                    }
                    None => {
                        warn!(connsid, "dropping outbound message for unknown connection");
                    }
                }
            }
        });

        Arc::new(Self {
            config,
            inbound_tx,
            outbound_tx,
            _inbound_worker: inbound_worker,
            _outbound_worker: outbound_worker,
        })
    }

    /// Enqueues an inbound envelope, blocking if this transport's inbound
    /// queue is bounded and full (a `0` cap makes it unbounded and this
    /// never blocks).
    pub async fn enqueue_inbound(&self, connsid: String, rmsg: Rmsg) {
        if self.inbound_tx.send_blocking((connsid, rmsg)).await.is_err() {
            warn!(conn_type = %self.config.conn_type, "inbound queue closed, message dropped");
        }
    }

    /// Enqueues an outbound envelope, dropping it with a warning if this
    /// transport's outbound queue is bounded and full (a `0` cap makes it
    /// unbounded and this never drops for fullness).
    pub fn enqueue_outbound(&self, connsid: String, rmsg: Rmsg) {
        if self.outbound_tx.try_send((connsid, rmsg)).is_err() {
            warn!(
                conn_type = %self.config.conn_type,
                connsid,
                "outbound queue full, message dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_drops_when_connection_is_unknown() {
        let conns: ConnTable = Arc::new(RwLock::new(HashMap::new()));
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);
        let transport = ActiveTransport::spawn(TransportConfig::server("t"), conns, dispatch_tx);

        transport.enqueue_outbound(
            "missing".to_string(),
            Rmsg {
                sid: "s".to_string(),
                lsid: None,
                bodycodeid: 0,
                body: serde_json::Value::Null,
            },
        );
        // No assertion beyond "doesn't panic" -- the warning is the only
        // observable effect and is exercised via log output, not state.
    }

    #[tokio::test]
    async fn on_recv_observer_fires_before_dispatch() {
        let conns: ConnTable = Arc::new(RwLock::new(HashMap::new()));
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(8);
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let seen2 = seen.clone();
        let config = TransportConfig::server("t").with_on_recv(Arc::new(move |connsid, _rmsg| {
            seen2.lock().unwrap().push(connsid.to_string());
        }));
        let transport = ActiveTransport::spawn(config, conns, dispatch_tx);

        transport
            .enqueue_inbound(
                "c1".to_string(),
                Rmsg {
                    sid: "s".to_string(),
                    lsid: None,
                    bodycodeid: 0,
                    body: serde_json::Value::Null,
                },
            )
            .await;

        let envelope = dispatch_rx.recv().await.unwrap();
        assert_eq!(envelope.connsid, "c1");
        assert_eq!(seen.lock().unwrap().as_slice(), ["c1".to_string()]);
    }

    #[tokio::test]
    async fn zero_cap_queue_is_unbounded_not_one_slot() {
        let conns: ConnTable = Arc::new(RwLock::new(HashMap::new()));
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(8);
        let config = TransportConfig::server("t").with_queue_caps(0, 0);
        let transport = ActiveTransport::spawn(config, conns, dispatch_tx);

        // A bounded queue with the old `.max(1)` clamp would block on the
        // second enqueue until something drains the first; a `0` cap must
        // accept many sends up front without blocking.
        for i in 0..32 {
            transport
                .enqueue_inbound(
                    "c1".to_string(),
                    Rmsg {
                        sid: format!("s{i}"),
                        lsid: None,
                        bodycodeid: 0,
                        body: serde_json::Value::Null,
                    },
                )
                .await;
        }

        for i in 0..32 {
            let envelope = dispatch_rx.recv().await.unwrap();
            assert_eq!(envelope.rmsg.sid, format!("s{i}"));
        }
    }
}
