use thiserror::Error;

/// Errors surfaced by the bus's public API.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("code `{0}` is not registered")]
    UnregisteredCode(String),
    #[error("code `{0}` uses the reserved `bus::` prefix")]
    ReservedCode(String),
    #[error("connection `{0}` is not known to this bus")]
    UnknownConnection(String),
    #[error("no connection in the ambient context")]
    NoAmbientConnection,
    #[error("rpc key `{0}` is already registered")]
    DuplicateRpcKey(String),
    #[error("rpc call (lsid `{0}`) timed out")]
    RpcTimeout(String),
    #[error("waiter for lsid `{0}` was dropped before a reply arrived")]
    WaiterDropped(String),
    #[error("a waiter is already registered for sid `{0}`")]
    AlreadyProcessed(String),
    #[error("the `{0}` opts.lsid operator is not recognized")]
    UnknownLsidOperator(String),
    #[error("SrpcSend/SrpcRecv cannot be published through pub/sub -- use reg_rpc")]
    RpcEnvelopeNotPublishable,
    #[error("subsid `{0}` is not known")]
    UnknownSub(String),
    #[error("remote error `{0}`: {1}")]
    Remote(String, String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;
