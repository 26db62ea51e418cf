//! Per-call option bags for `Bus::pub_opts`/`Bus::sub_opts`.
//!
//! Kept as a separate module from `bus` because both the publish and the
//! subscribe path share the same filter/interrupt vocabulary (`FilterOutcome`)
//! even though they plug it in at different points of the pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a filter decided about one body.
pub enum FilterOutcome {
    /// Keep going with (possibly transformed) `body`.
    Continue(serde_json::Value),
    /// Stop the pipeline here; `body` becomes the final result without
    /// running any later filter, condition, or (for input filters) the
    /// subfn itself.
    Interrupt(serde_json::Value),
}

/// A single-argument transform applied to a body before/after a subfn runs.
pub type Filter = Arc<dyn Fn(serde_json::Value) -> BoxFuture<FilterOutcome> + Send + Sync>;

/// A single-argument predicate gating whether a subfn runs at all.
pub type Condition = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Options accepted by `Bus::sub_opts`.
///
/// Filters run in a fixed order: global input
/// filters, then local input filters, then conditions, then the raw
/// subfn, then global output filters, then local output filters. An
/// `Interrupt` from any filter short-circuits the rest of the pipeline
/// (including, for an input filter, the subfn itself) and its carried
/// body is what gets published in the subfn's place.
#[derive(Default)]
pub struct SubOpts {
    /// If true and a message of this code was published before this
    /// subscriber registered, replay the cached body once, synchronously,
    /// before `sub_opts` returns.
    pub recv_last_msg: bool,
    pub global_input_filters: Vec<Filter>,
    pub local_input_filters: Vec<Filter>,
    pub conditions: Vec<Condition>,
    pub global_output_filters: Vec<Filter>,
    pub local_output_filters: Vec<Filter>,
}

impl SubOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_last_msg(mut self) -> Self {
        self.recv_last_msg = true;
        self
    }

    pub fn with_condition(mut self, cond: Condition) -> Self {
        self.conditions.push(cond);
        self
    }

    pub fn with_local_input_filter(mut self, filter: Filter) -> Self {
        self.local_input_filters.push(filter);
        self
    }

    pub fn with_local_output_filter(mut self, filter: Filter) -> Self {
        self.local_output_filters.push(filter);
        self
    }
}

/// Options accepted by `Bus::pub_opts`.
pub struct PubOpts {
    /// Explicit delivery targets for the network phase. `None` falls back
    /// to the ambient context's connsid (i.e. "reply to whoever triggered
    /// this"), which is itself `None` outside of a dispatch -- at which
    /// point the network phase is a no-op.
    pub target_connsids: Option<Vec<String>>,
    /// `None` resolves through the ambient-context chain (subfn_lsid, then
    /// msid). `Some("$ctx::msid")` explicitly requests the ambient msid.
    /// Any other `Some(s)` where `s` starts with `$` is a value error.
    /// Any other `Some(s)` is used verbatim.
    pub lsid: Option<String>,
    pub send_to_net: bool,
    pub send_to_inner: bool,
}

impl Default for PubOpts {
    fn default() -> Self {
        Self {
            target_connsids: None,
            lsid: None,
            send_to_net: true,
            send_to_inner: true,
        }
    }
}

impl PubOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(mut self, connsids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.target_connsids = Some(connsids.into_iter().map(Into::into).collect());
        self
    }

    pub fn reply_to(mut self, lsid: impl Into<String>) -> Self {
        self.lsid = Some(lsid.into());
        self
    }

    pub fn net_only(mut self) -> Self {
        self.send_to_inner = false;
        self
    }

    pub fn inner_only(mut self) -> Self {
        self.send_to_net = false;
        self
    }
}
