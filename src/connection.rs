use std::collections::HashMap;

use async_trait::async_trait;
use bus_protocol::Rmsg;

use crate::error::BusResult;

/// A single logical connection to a remote peer, abstracted away from
/// whatever concrete transport carries it (WebSocket, TCP, an in-memory
/// pipe in tests, ...).
///
/// Methods take `&self` rather than `&mut self` because a connection is
/// shared between its own read loop task and the transport's outbound
/// worker task — implementors hold whatever interior mutability they need
/// (a `Mutex`-guarded writer half, a channel, ...). The token set is the
/// one piece of connection state the bus itself needs to mutate (via
/// `Bus::set_conn_tokens`), so it is exposed as snapshot-in/replace-out
/// rather than a borrowed reference.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable identifier for this connection, assigned at accept time.
    fn connsid(&self) -> &str;

    /// Snapshot of the arbitrary values carried alongside this connection
    /// (auth claims, remote address, ...), opaque to the bus itself.
    async fn tokens(&self) -> HashMap<String, String>;

    /// Replaces the token set wholesale.
    async fn set_tokens(&self, tokens: HashMap<String, String>);

    /// Waits for and returns the next inbound envelope, or `Ok(None)` once
    /// the peer has cleanly closed the connection.
    async fn recv(&self) -> BusResult<Option<Rmsg>>;

    /// Sends an envelope to the peer.
    async fn send(&self, msg: &Rmsg) -> BusResult<()>;

    /// Tears the connection down. Called at most once per connection;
    /// implementors should make repeat calls harmless.
    async fn close(&self);
}
