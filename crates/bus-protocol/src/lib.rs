// bus-protocol: wire-level types for the message bus.
//
// A `Coded` type is any payload the bus can carry: it names its own wire
// code via an associated const, and the engine assigns it a numeric codeid
// at registration time. `Rmsg` is the on-the-wire envelope every message
// is framed as, regardless of which `Coded` type its body deserializes to.
//
// This crate has no async, no I/O and no knowledge of transports or
// connections -- it only knows how to name and frame messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Prefix reserved for codes the bus itself defines. Callers registering
/// their own types with `reg_types` must not use this prefix.
pub const RESERVED_PREFIX: &str = "bus::";

/// Fixed ordering applied to reserved codes before any caller-registered
/// code is assigned a codeid. `welcome` is always codeid 0, `ok` is always
/// codeid 1 -- callers and tests can rely on this.
pub const DEFAULT_CODE_ORDER: &[&str] = &[
    Welcome::CODE,
    Ok::CODE,
    ErrorBody::CODE,
    SrpcSend::CODE,
    SrpcRecv::CODE,
];

/// A type that can be carried as a bus message body.
///
/// `CODE` is the wire name; the registry maps it to a numeric codeid once
/// registered so the envelope doesn't need to repeat the string on every
/// message.
pub trait Coded: Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static {
    const CODE: &'static str;
}

/// The wire envelope. `bodycodeid` is a registry-assigned index, not the
/// code string itself -- the registry is what turns one into the other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rmsg {
    pub sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsid: Option<String>,
    pub bodycodeid: u32,
    pub body: serde_json::Value,
}

/// Sent once per connection immediately after accept, listing every code
/// the server has registered in codeid order. The client's own codeid
/// table is expected to mirror this list index-for-index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    pub codes: Vec<String>,
}

impl Coded for Welcome {
    const CODE: &'static str = "bus::welcome";
}

/// Empty acknowledgement body, returned by a subfn/RPC handler that has
/// nothing else to say but did not error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Ok {}

impl Coded for Ok {
    const CODE: &'static str = "bus::ok";
}

/// Error kinds the engine itself produces. Not a closed set -- handler
/// code is free to use its own strings too.
pub mod error_kind {
    pub const VALUE: &str = "value_error";
    pub const NOT_FOUND: &str = "not_found_error";
    pub const ALREADY_PROCESSED: &str = "already_processed_error";
    pub const UNREGISTERED_CODE: &str = "unregistered_code_error";
    pub const TIMEOUT: &str = "timeout_error";
    pub const INTERNAL: &str = "internal_error";
}

/// Error descriptor sent back in place of a successful retval. Deliberately
/// has no stacktrace field -- that's local-debugging state a handler's own
/// error type may carry, not something the wire format exposes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl Coded for ErrorBody {
    const CODE: &'static str = "bus::error";
}

/// Outbound call into a registered RPC handler, keyed by the handler's
/// registration key rather than its function name (Rust has no runtime
/// reflection to recover a stripped `srpc__` prefix from).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SrpcSend {
    pub key: String,
    pub body: serde_json::Value,
}

impl Coded for SrpcSend {
    const CODE: &'static str = "bus::srpc_send";
}

/// Reply to a `SrpcSend`, correlated back to the call via the envelope's
/// `lsid`. Transparent: the wire body is whatever the handler returned, or
/// an `ErrorBody`, with no extra wrapper field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SrpcRecv(pub serde_json::Value);

impl Coded for SrpcRecv {
    const CODE: &'static str = "bus::srpc_recv";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_code_order_puts_welcome_first_and_ok_second() {
        assert_eq!(DEFAULT_CODE_ORDER[0], "bus::welcome");
        assert_eq!(DEFAULT_CODE_ORDER[1], "bus::ok");
    }

    #[test]
    fn reserved_codes_all_carry_the_prefix() {
        for code in DEFAULT_CODE_ORDER {
            assert!(code.starts_with(RESERVED_PREFIX));
        }
    }

    #[test]
    fn rmsg_round_trips_through_json() {
        let msg = Rmsg {
            sid: "abc".to_string(),
            lsid: Some("def".to_string()),
            bodycodeid: 3,
            body: serde_json::json!({"x": 1}),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: Rmsg = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn rmsg_omits_lsid_when_absent() {
        let msg = Rmsg {
            sid: "abc".to_string(),
            lsid: None,
            bodycodeid: 0,
            body: serde_json::Value::Null,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("lsid"));
    }

    #[test]
    fn srpc_recv_serializes_transparently() {
        let recv = SrpcRecv(serde_json::json!({"ok": true}));
        let text = serde_json::to_string(&recv).unwrap();
        assert_eq!(text, r#"{"ok":true}"#);
    }

    #[test]
    fn error_body_has_no_stacktrace_field() {
        let err = ErrorBody::new(error_kind::NOT_FOUND, "no such subsid");
        let value = serde_json::to_value(&err).unwrap();
        assert!(value.get("stacktrace").is_none());
        assert_eq!(value.get("kind").unwrap(), error_kind::NOT_FOUND);
    }
}
