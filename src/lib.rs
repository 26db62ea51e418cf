//! `msgbus`: a bidirectional message bus that multiplexes typed
//! application messages over multiple connection-oriented transports.
//!
//! The bus accepts already-established connections (see [`Connection`]),
//! greets each with a code catalog ([`Welcome`]), then routes inbound
//! messages either to in-process subscribers ([`Bus::sub`]) or to
//! registered remote-procedure handlers ([`Bus::reg_rpc`]), and routes
//! outbound messages back to one or more target connections
//! ([`Bus::publish`]/[`Bus::pub_opts`]).
//!
//! Concrete wire transports (websocket, UDP, ...) are external
//! collaborators: this crate owns the engine (code registry, envelope
//! codec, RPC dispatcher, per-transport queues) and takes any
//! [`Connection`] implementation handed to [`Bus::conn`]. See
//! `services/bus-server` for a websocket transport built on this engine,
//! and `bus-test-support` for an in-memory one used by this crate's own
//! tests.

pub mod bus;
pub mod connection;
pub mod context;
pub mod error;
pub mod message;
pub mod opts;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use bus::{Bus, BusConfig, PostinitHook, RpcCtxFn};
pub use bus_protocol::{Coded, ErrorBody, Rmsg, SrpcRecv, SrpcSend, Welcome, error_kind};
pub use connection::Connection;
pub use context::{Ctx, CtxState};
pub use error::{BusError, BusResult};
pub use message::{BusMsg, PubItem, PubList, SubFnRetval};
pub use opts::{Condition, Filter, FilterOutcome, PubOpts, SubOpts};
pub use registry::CodeRegistry;
pub use rpc::RpcRegistry;
pub use transport::{ActiveTransport, InboundEnvelope, Observer, TransportConfig};
