use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bus_protocol::{Coded, ErrorBody, Rmsg, SrpcRecv, SrpcSend, Welcome, error_kind};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::context::{Ctx, CtxState};
use crate::error::{BusError, BusResult};
use crate::message::{BusMsg, PubList, SubFnRetval};
use crate::opts::{FilterOutcome, PubOpts, SubOpts};
use crate::registry::CodeRegistry;
use crate::rpc::RpcRegistry;
use crate::transport::{ActiveTransport, InboundEnvelope, TransportConfig};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ErasedSubFn = Arc<dyn Fn(serde_json::Value) -> BoxFuture<SubFnRetval> + Send + Sync>;
type ConnTable = Arc<RwLock<HashMap<String, Arc<dyn Connection>>>>;
/// Produces a scoped resource for one RPC dispatch; dropped when the
/// dispatch (handler call + reply publish) completes, so a handler that
/// needs e.g. a pooled connection gets it released deterministically
/// without threading a guard through every handler signature.
pub type RpcCtxFn = Arc<dyn Fn() -> Box<dyn std::any::Any + Send> + Send + Sync>;

struct Subscription {
    code: String,
}

/// Configuration passed to `Bus::init`.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How many envelopes may be queued between a transport's inbound
    /// worker and the bus's single dispatcher before it starts blocking.
    pub dispatch_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dispatch_capacity: 1024,
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A postinit hook, run once on the first accepted connection.
pub type PostinitHook = Box<dyn Fn() + Send + Sync>;

struct BusInner {
    registry: RwLock<CodeRegistry>,
    conns: ConnTable,
    transports: RwLock<HashMap<String, Arc<ActiveTransport>>>,
    subs: RwLock<HashMap<String, Subscription>>,
    subs_by_code: RwLock<HashMap<String, Vec<String>>>,
    handlers: RwLock<HashMap<String, ErasedSubFn>>,
    last_msg: RwLock<HashMap<String, BusMsg>>,
    waiters: RwLock<HashMap<String, oneshot::Sender<BusMsg>>>,
    /// Which transport (by `conn_type`) accepted each live connsid, so a
    /// reply can be routed straight to the transport holding it instead of
    /// probed for across every registered transport.
    conn_transport: RwLock<HashMap<String, String>>,
    rpc: RpcRegistry,
    rpc_ctxfn: RwLock<Option<RpcCtxFn>>,
    postinit_done: AtomicBool,
    postinit_hook: RwLock<Option<PostinitHook>>,
    dispatch_tx: mpsc::Sender<InboundEnvelope>,
    dispatcher_task: RwLock<Option<JoinHandle<()>>>,
    /// Self-removing RPC dispatch tasks, tracked so `destroy` can see how
    /// many are in flight (though it does not await them -- matching the
    /// source's documented "in-flight RPC tasks are not awaited" behavior
    /// on teardown).
    rpc_tasks: Arc<RwLock<HashMap<u64, JoinHandle<()>>>>,
    rpc_task_counter: AtomicU64,
}

/// The bus coordinator.
///
/// `Bus` is a cheap-to-clone handle (an `Arc` around shared state), not a
/// process singleton -- tests and multi-tenant hosts can run several
/// independent buses side by side. A fresh `Bus::init` after an earlier
/// bus's `destroy` behaves identically to a brand new `Bus::init`, since
/// there is no global state outside of what an instance owns.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Builds a bus and starts its single dispatcher task.
    ///
    /// Registers the reserved built-in types (`Welcome`, `Ok`, `ErrorBody`,
    /// `SrpcSend`, `SrpcRecv`) before returning -- this is what makes
    /// `welcome` codeid 0 and `ok` codeid 1 in every deployment.
    pub fn init(cfg: BusConfig) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(cfg.dispatch_capacity.max(1));
        let inner = Arc::new(BusInner {
            registry: RwLock::new(CodeRegistry::new()),
            conns: Arc::new(RwLock::new(HashMap::new())),
            transports: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashMap::new()),
            subs_by_code: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            last_msg: RwLock::new(HashMap::new()),
            waiters: RwLock::new(HashMap::new()),
            conn_transport: RwLock::new(HashMap::new()),
            rpc: RpcRegistry::new(),
            rpc_ctxfn: RwLock::new(None),
            postinit_done: AtomicBool::new(false),
            postinit_hook: RwLock::new(None),
            dispatch_tx,
            dispatcher_task: RwLock::new(None),
            rpc_tasks: Arc::new(RwLock::new(HashMap::new())),
            rpc_task_counter: AtomicU64::new(0),
        });

        let bus = Self { inner };
        let dispatcher_bus = bus.clone();
        let task = tokio::spawn(async move {
            dispatcher_bus.run_dispatcher(dispatch_rx).await;
        });
        if let Ok(mut slot) = bus.inner.dispatcher_task.try_write() {
            *slot = Some(task);
        }
        bus
    }

    /// Tears the bus down: stops the dispatcher and forgets every
    /// connection, transport, subscription and cached message. Connections
    /// are not explicitly closed here -- callers that want a clean
    /// disconnect should `close_conn` each one first.
    pub async fn destroy(&self) {
        if let Some(task) = self.inner.dispatcher_task.write().await.take() {
            task.abort();
        }
        self.inner.conns.write().await.clear();
        self.inner.transports.write().await.clear();
        self.inner.subs.write().await.clear();
        self.inner.subs_by_code.write().await.clear();
        self.inner.handlers.write().await.clear();
        self.inner.last_msg.write().await.clear();
        self.inner.waiters.write().await.clear();
        self.inner.conn_transport.write().await.clear();
        self.inner.postinit_done.store(false, Ordering::SeqCst);
        // In-flight RPC tasks are aborted, not awaited -- a handler stuck
        // mid-call must not block teardown.
        for (_, task) in self.inner.rpc_tasks.write().await.drain() {
            task.abort();
        }
        info!("bus destroyed");
    }

    /// Installs the hook run once, on the first accepted connection. Must
    /// be called before the first `conn`; later calls are ignored.
    pub async fn set_postinit_hook(&self, hook: PostinitHook) {
        let mut slot = self.inner.postinit_hook.write().await;
        if slot.is_none() {
            *slot = Some(hook);
        }
    }

    /// Installs the hook `call_rpc` invokes around every dispatch to
    /// obtain a scoped resource (held until the handler call and its reply
    /// publish complete, then dropped).
    pub async fn set_rpc_ctxfn(&self, ctxfn: RpcCtxFn) {
        *self.inner.rpc_ctxfn.write().await = Some(ctxfn);
    }

    // -- registration ---------------------------------------------------

    /// Registers `T::CODE`. Re-registering an already-known code is a
    /// no-op; only the reserved namespace is rejected.
    pub async fn reg_type<T: Coded>(&self) -> BusResult<()> {
        self.inner.registry.write().await.register(T::CODE)?;
        self.broadcast_welcome().await;
        Ok(())
    }

    /// Registers several codes at once, in the given order. Useful when a
    /// caller's codes aren't known as Rust types at the call site (e.g. a
    /// transport registering codes read from configuration).
    pub async fn reg_types(&self, codes: &[&str]) -> BusResult<()> {
        {
            let mut registry = self.inner.registry.write().await;
            for code in codes {
                registry.register(code)?;
            }
        }
        self.broadcast_welcome().await;
        Ok(())
    }

    pub async fn has_code(&self, code: &str) -> bool {
        self.inner.registry.read().await.has_code(code)
    }

    pub async fn type_id_of(&self, code: &str) -> Option<u32> {
        self.inner.registry.read().await.id_of(code)
    }

    pub async fn snapshot_codes(&self) -> Vec<String> {
        self.inner.registry.read().await.codes_in_order().to_vec()
    }

    /// Every connsid currently accepted by this bus, in no particular
    /// order. Useful for a subfn that wants to fan a message out to every
    /// open connection rather than just reply to its sender.
    pub async fn connsids(&self) -> Vec<String> {
        self.inner.conns.read().await.keys().cloned().collect()
    }

    /// Registers an RPC handler under `key`. `T` is the call's body type,
    /// `R` is its successful retval type; handler errors are carried back
    /// as `ErrorBody` regardless of `R`. A second registration of the same
    /// key fails.
    pub async fn reg_rpc<T, R, F, Fut>(&self, key: impl Into<String>, handler: F) -> BusResult<()>
    where
        T: Coded,
        R: Coded,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorBody>> + Send + 'static,
    {
        self.inner.rpc.register(key, handler).await
    }

    // -- subscriptions ----------------------------------------------------

    /// Subscribes `subfn` to every message published with code `T::CODE`,
    /// with no filters, no conditions and no last-message replay. See
    /// `sub_opts` for the full pipeline.
    pub async fn sub<T, F, Fut>(&self, subfn: F) -> BusResult<String>
    where
        T: Coded,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubFnRetval> + Send + 'static,
    {
        self.sub_opts(subfn, SubOpts::new()).await
    }

    /// Subscribes `subfn` to every message published with code `T::CODE`,
    /// running it through the opts pipeline: global input filters, local
    /// input filters, conditions, the raw subfn, global output filters,
    /// local output filters. Returns the generated subsid.
    /// `T::CODE` must already be registered, and may not be `SrpcSend`/
    /// `SrpcRecv` (those are routed through `reg_rpc` instead).
    pub async fn sub_opts<T, F, Fut>(&self, subfn: F, opts: SubOpts) -> BusResult<String>
    where
        T: Coded,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubFnRetval> + Send + 'static,
    {
        if T::CODE == SrpcSend::CODE || T::CODE == SrpcRecv::CODE {
            return Err(BusError::RpcEnvelopeNotPublishable);
        }
        if !self.inner.registry.read().await.has_code(T::CODE) {
            return Err(BusError::UnregisteredCode(T::CODE.to_string()));
        }

        let SubOpts {
            recv_last_msg,
            global_input_filters,
            local_input_filters,
            conditions,
            global_output_filters,
            local_output_filters,
        } = opts;

        // `subfn` must be cloned into each call's boxed future rather than
        // borrowed: the erased handler only gets `&self` access per call,
        // but the future it returns is required to be `'static`.
        let subfn = Arc::new(subfn);
        let code = T::CODE.to_string();
        let handler: ErasedSubFn = Arc::new(move |value: serde_json::Value| {
            let subfn = subfn.clone();
            let code = code.clone();
            let global_input_filters = global_input_filters.clone();
            let local_input_filters = local_input_filters.clone();
            let conditions = conditions.clone();
            let global_output_filters = global_output_filters.clone();
            let local_output_filters = local_output_filters.clone();
            Box::pin(async move {
                let mut value = value;
                for filter in global_input_filters.iter().chain(local_input_filters.iter()) {
                    match filter(value).await {
                        FilterOutcome::Continue(v) => value = v,
                        FilterOutcome::Interrupt(v) => {
                            return SubFnRetval::Publish(PubList(vec![crate::message::PubItem {
                                code: code.clone(),
                                value: v,
                            }]));
                        }
                    }
                }

                for condition in &conditions {
                    if !condition(&value) {
                        return SubFnRetval::Skip;
                    }
                }

                let body: Result<T, _> = serde_json::from_value(value);
                let mut retval = match body {
                    Ok(body) => subfn(body).await,
                    Err(e) => SubFnRetval::err(error_kind::VALUE, e.to_string()),
                };

                // Output filters apply to the common single-retval shape.
                // A subfn that fans out to several heterogeneous retvals
                // skips output filtering -- there is no single body left
                // to feed them.
                if let SubFnRetval::Publish(PubList(items)) | SubFnRetval::Interrupt(PubList(items)) =
                    &mut retval
                {
                    if items.len() == 1 {
                        let mut v = items[0].value.clone();
                        for filter in
                            global_output_filters.iter().chain(local_output_filters.iter())
                        {
                            match filter(v).await {
                                FilterOutcome::Continue(nv) => v = nv,
                                FilterOutcome::Interrupt(nv) => {
                                    v = nv;
                                    break;
                                }
                            }
                        }
                        items[0].value = v;
                    }
                }

                retval
            })
        });

        let subsid = Uuid::new_v4().to_string();
        self.inner
            .subs
            .write()
            .await
            .insert(subsid.clone(), Subscription { code: T::CODE.to_string() });
        self.inner.handlers.write().await.insert(subsid.clone(), handler.clone());
        self.inner
            .subs_by_code
            .write()
            .await
            .entry(T::CODE.to_string())
            .or_default()
            .push(subsid.clone());

        if recv_last_msg {
            if let Some(cached) = self.inner.last_msg.read().await.get(T::CODE).cloned() {
                self.deliver_one(&handler, cached.body.clone()).await;
            }
        }

        Ok(subsid)
    }

    /// Removes `subsid` from every subscription table. Absence is a
    /// not-found error rather than a silent no-op.
    pub async fn unsub(&self, subsid: &str) -> BusResult<()> {
        let removed = self.inner.subs.write().await.remove(subsid);
        self.inner.handlers.write().await.remove(subsid);
        let Some(sub) = removed else {
            return Err(BusError::UnknownSub(subsid.to_string()));
        };
        if let Some(list) = self.inner.subs_by_code.write().await.get_mut(&sub.code) {
            list.retain(|s| s != subsid);
        }
        Ok(())
    }

    /// Removes several subsids, continuing past any individual
    /// not-found error and logging it rather than aborting the batch.
    pub async fn unsub_many(&self, subsids: &[String]) {
        for subsid in subsids {
            if let Err(e) = self.unsub(subsid).await {
                warn!(subsid, error = %e, "unsub_many: failed to remove subscription");
            }
        }
    }

    // -- publishing -------------------------------------------------------

    /// Publishes `body` with default opts: net phase replies to the
    /// ambient connection (if any), inner phase reaches every local
    /// subscriber, and the outgoing lsid defaults to the ambient
    /// `subfn_lsid`/`msid` chain.
    pub async fn publish<T: Coded>(&self, body: T) -> BusResult<()> {
        self.pub_opts(body, PubOpts::new()).await
    }

    /// Publishes `body` as an explicit reply to `lsid`, bypassing the
    /// ambient-context default.
    pub async fn publish_as_reply_to<T: Coded>(&self, body: T, lsid: impl Into<String>) -> BusResult<()> {
        self.pub_opts(body, PubOpts::new().reply_to(lsid)).await
    }

    /// Publishes `body` under the full opts surface: explicit targets,
    /// explicit/`$ctx::msid` lsid operators, and net/inner phase gating
    /// .
    pub async fn pub_opts<T: Coded>(&self, body: T, opts: PubOpts) -> BusResult<()> {
        if T::CODE == SrpcSend::CODE || T::CODE == SrpcRecv::CODE {
            return Err(BusError::RpcEnvelopeNotPublishable);
        }
        let value = serde_json::to_value(&body)?;
        let sid = Uuid::new_v4().to_string();
        let lsid = self.resolve_lsid(opts.lsid.as_deref())?;
        self.publish_value_with_sid(T::CODE, value, &sid, lsid, &opts).await
    }

    /// Publishes `body` under `opts` (the spec's `pubr(body, opts)`,
    /// including its `target_connsids`/net-or-inner gating) and waits up
    /// to `timeout` for a reply linked to this call (i.e. a retval
    /// published with lsid equal to this call's own generated sid). If
    /// the reply is itself an `ErrorBody`, that is surfaced as `Err`
    /// rather than deserialized as `R`. `opts.lsid` is ignored: this call
    /// always waits on its own freshly generated sid, never a caller-given
    /// lsid.
    pub async fn publish_request<T, R>(&self, body: T, timeout: Duration, opts: PubOpts) -> BusResult<R>
    where
        T: Coded,
        R: Coded,
    {
        if T::CODE == SrpcSend::CODE || T::CODE == SrpcRecv::CODE {
            return Err(BusError::RpcEnvelopeNotPublishable);
        }

        let sid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.waiters.write().await;
            if waiters.contains_key(&sid) {
                return Err(BusError::AlreadyProcessed(sid));
            }
            waiters.insert(sid.clone(), tx);
        }

        let value = serde_json::to_value(&body)?;
        if let Err(e) = self
            .publish_value_with_sid(T::CODE, value, &sid, None, &opts)
            .await
        {
            self.inner.waiters.write().await.remove(&sid);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => {
                if msg.code == ErrorBody::CODE {
                    let err: ErrorBody = serde_json::from_value(msg.body)?;
                    return Err(BusError::Remote(err.kind, err.message));
                }
                Ok(serde_json::from_value(msg.body)?)
            }
            Ok(Err(_)) => Err(BusError::WaiterDropped(sid)),
            Err(_) => {
                self.inner.waiters.write().await.remove(&sid);
                Err(BusError::RpcTimeout(sid))
            }
        }
    }

    /// Resolves an `opts.lsid` value: `None` falls back
    /// to the ambient context chain, `"$ctx::msid"` explicitly requests
    /// the ambient msid, any other leading-`$` string is a value error,
    /// and anything else passes through unchanged.
    fn resolve_lsid(&self, opts_lsid: Option<&str>) -> BusResult<Option<String>> {
        match opts_lsid {
            None => Ok(Ctx::subfn_lsid().or_else(Ctx::msid)),
            Some("$ctx::msid") => Ok(Ctx::msid()),
            Some(s) if s.starts_with('$') => Err(BusError::UnknownLsidOperator(s.to_string())),
            Some(s) => Ok(Some(s.to_string())),
        }
    }

    async fn publish_value_with_sid(
        &self,
        code: &str,
        value: serde_json::Value,
        sid: &str,
        lsid: Option<String>,
        opts: &PubOpts,
    ) -> BusResult<()> {
        let msg = BusMsg {
            sid: sid.to_string(),
            lsid: lsid.clone(),
            code: code.to_string(),
            body: value,
        };

        self.inner
            .last_msg
            .write()
            .await
            .insert(code.to_string(), msg.clone());

        // Phase 1: network.
        if opts.send_to_net {
            let targets = opts
                .target_connsids
                .clone()
                .or_else(|| Ctx::connsid().map(|c| vec![c]));
            if let Some(targets) = targets {
                for connsid in targets {
                    self.send_to_conn(&connsid, &msg).await;
                }
            }
        }

        // Phase 2: in-process subscribers.
        if opts.send_to_inner {
            self.dispatch_to_subs(&msg).await;
        }

        // Phase 3: linked-sid waiter, unconditional whenever lsid is set.
        if let Some(lsid) = &lsid {
            if let Some(tx) = self.inner.waiters.write().await.remove(lsid) {
                let _ = tx.send(msg);
            }
        }

        Ok(())
    }

    async fn dispatch_to_subs(&self, msg: &BusMsg) {
        let subsids = self
            .inner
            .subs_by_code
            .read()
            .await
            .get(&msg.code)
            .cloned()
            .unwrap_or_default();

        for subsid in subsids {
            let handler = self.inner.handlers.read().await.get(&subsid).cloned();
            let Some(handler) = handler else { continue };

            let retval = Ctx::scope(
                CtxState {
                    msid: Some(msg.sid.clone()),
                    connsid: Ctx::connsid(),
                    subfn_lsid: None,
                },
                || handler(msg.body.clone()),
            )
            .await;

            match retval {
                SubFnRetval::Skip => {}
                SubFnRetval::Publish(list) => {
                    self.publish_list(list).await;
                }
                SubFnRetval::Interrupt(list) => {
                    self.publish_list(list).await;
                    break;
                }
            }
        }
    }

    /// Runs a single erased handler directly against `body`, used to
    /// replay the last cached message of a code to a newly registered
    /// subscriber. Failures are logged, not propagated -- a malformed
    /// cache entry must not block `sub_opts` from returning.
    async fn deliver_one(&self, handler: &ErasedSubFn, body: serde_json::Value) {
        let retval = handler(body).await;
        match retval {
            SubFnRetval::Publish(list) | SubFnRetval::Interrupt(list) => {
                self.publish_list(list).await;
            }
            SubFnRetval::Skip => {}
        }
    }

    /// Republishes every retval of one subfn invocation.
    ///
    /// Returns a boxed, type-erased future rather than being a plain
    /// `async fn`: `publish_value_with_sid` awaits `dispatch_to_subs`,
    /// which awaits this function, which awaits `publish_value_with_sid`
    /// again -- a cycle of ordinary `async fn`s that transitively await
    /// one another has no finite layout (rustc rejects it as a recursive
    /// type). Boxing this one edge erases its concrete future type and
    /// gives the compiler a fixed-size pointer to close the cycle with.
    ///
    /// Retvals are published net + linked only (`send_to_inner = false`):
    /// re-entering the inner dispatch here would hand the retval straight
    /// back to the same code's subscribers, including the subfn that just
    /// produced it. For an echo-style subfn (subscribed to the same code
    /// it publishes, e.g. S2's `TA -> TA{value+1}`) that would re-trigger
    /// itself forever instead of sending the single reply the caller over
    /// the network is waiting for.
    fn publish_list<'a>(&'a self, list: PubList) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for item in list.0 {
                let sid = Uuid::new_v4().to_string();
                let lsid = Ctx::subfn_lsid().or_else(Ctx::msid);
                if let Err(e) = self
                    .publish_value_with_sid(
                        &item.code,
                        item.value,
                        &sid,
                        lsid,
                        &PubOpts::new().net_only(),
                    )
                    .await
                {
                    warn!(code = %item.code, error = %e, "failed to publish subfn retval");
                }
            }
        })
    }

    async fn send_to_conn(&self, connsid: &str, msg: &BusMsg) {
        let bodycodeid = match self.inner.registry.read().await.id_of(&msg.code) {
            Some(id) => id,
            None => {
                warn!(code = %msg.code, "cannot send unregistered code over the network");
                return;
            }
        };
        let rmsg = Rmsg {
            sid: msg.sid.clone(),
            lsid: msg.lsid.clone(),
            bodycodeid,
            body: msg.body.clone(),
        };
        let conn_type = self.inner.conn_transport.read().await.get(connsid).cloned();
        let Some(conn_type) = conn_type else {
            debug!(connsid, "no active transport holds this connection, skipping send");
            return;
        };
        let transport = self.inner.transports.read().await.get(&conn_type).cloned();
        if let Some(transport) = transport {
            transport.enqueue_outbound(connsid.to_string(), rmsg);
        }
    }

    // -- tokens -------------------------------------------------------------

    pub async fn get_conn_tokens(&self, connsid: &str) -> BusResult<HashMap<String, String>> {
        let conn = self.inner.conns.read().await.get(connsid).cloned();
        match conn {
            Some(c) => Ok(c.tokens().await),
            None => Err(BusError::UnknownConnection(connsid.to_string())),
        }
    }

    pub async fn set_conn_tokens(&self, connsid: &str, tokens: HashMap<String, String>) -> BusResult<()> {
        let conn = self.inner.conns.read().await.get(connsid).cloned();
        match conn {
            Some(c) => {
                c.set_tokens(tokens).await;
                Ok(())
            }
            None => Err(BusError::UnknownConnection(connsid.to_string())),
        }
    }

    pub async fn get_ctx_conn_tokens(&self) -> BusResult<HashMap<String, String>> {
        match Ctx::connsid() {
            Some(connsid) => self.get_conn_tokens(&connsid).await,
            None => Err(BusError::NoAmbientConnection),
        }
    }

    pub async fn set_ctx_conn_tokens(&self, tokens: HashMap<String, String>) -> BusResult<()> {
        match Ctx::connsid() {
            Some(connsid) => self.set_conn_tokens(&connsid, tokens).await,
            None => Err(BusError::NoAmbientConnection),
        }
    }

    // -- ambient context accessors -------------------------------------------

    pub fn get_ctx(&self) -> CtxState {
        Ctx::snapshot()
    }

    pub fn get_ctx_connsid(&self) -> Option<String> {
        Ctx::connsid()
    }

    pub fn get_ctx_key(&self, key: &str) -> Option<String> {
        match key {
            "msid" => Ctx::msid(),
            "connsid" => Ctx::connsid(),
            "subfn_lsid" => Ctx::subfn_lsid(),
            _ => None,
        }
    }

    // -- transports and connections --------------------------------------

    /// Registers a transport. A duplicate `conn_type` is
    /// logged and skipped rather than rejected or replacing the original.
    pub async fn reg_transport(&self, config: TransportConfig) -> BusResult<()> {
        let mut transports = self.inner.transports.write().await;
        if transports.contains_key(&config.conn_type) {
            warn!(
                conn_type = %config.conn_type,
                "a transport is already registered for this connection kind, skipping"
            );
            return Ok(());
        }
        let transport = ActiveTransport::spawn(
            config.clone(),
            self.inner.conns.clone(),
            self.inner.dispatch_tx.clone(),
        );
        transports.insert(config.conn_type, transport);
        Ok(())
    }

    /// Accepts `connection` onto the transport registered for `conn_type`,
    /// sends it a `Welcome` listing every registered code, runs the
    /// postinit hook if this is the first connection ever accepted, and
    /// spawns its read loop.
    ///
    /// If `conn_type` names a non-server transport, this logs a warning
    /// and returns `Ok(())` without registering the connection -- only
    /// server transports accept inbound connections.
    pub async fn conn(&self, conn_type: &str, connection: Arc<dyn Connection>) -> BusResult<()> {
        let transport = {
            let transports = self.inner.transports.read().await;
            transports.get(conn_type).cloned()
        };
        let Some(transport) = transport else {
            return Err(BusError::UnknownConnection(conn_type.to_string()));
        };
        if !transport.config.is_server {
            warn!(conn_type, "conn called on a non-server transport, skipping");
            return Ok(());
        }

        if !self.inner.postinit_done.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.inner.postinit_hook.read().await.as_ref() {
                hook();
            }
        }

        let connsid = connection.connsid().to_string();
        self.inner
            .conns
            .write()
            .await
            .insert(connsid.clone(), connection.clone());
        self.inner
            .conn_transport
            .write()
            .await
            .insert(connsid.clone(), transport.config.conn_type.clone());

        let welcome = Welcome {
            codes: self.inner.registry.read().await.codes_in_order().to_vec(),
        };
        let rmsg = Rmsg {
            sid: Uuid::new_v4().to_string(),
            lsid: None,
            bodycodeid: self
                .inner
                .registry
                .read()
                .await
                .id_of(Welcome::CODE)
                .expect("welcome is always registered"),
            body: serde_json::to_value(&welcome)?,
        };
        if let Err(e) = connection.send(&rmsg).await {
            warn!(connsid, error = %e, "failed to send welcome");
        }

        let bus = self.clone();
        let transport_for_read = transport.clone();
        let conn_for_read = connection.clone();
        let connsid_for_read = connsid.clone();
        tokio::spawn(async move {
            loop {
                let recv_result = match transport_for_read.config.inactivity_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, conn_for_read.recv()).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(connsid = %connsid_for_read, "inactivity timeout expired, closing connection");
                            break;
                        }
                    },
                    None => conn_for_read.recv().await,
                };
                match recv_result {
                    Ok(Some(rmsg)) => {
                        transport_for_read
                            .enqueue_inbound(connsid_for_read.clone(), rmsg)
                            .await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(connsid = %connsid_for_read, error = %e, "connection read failed");
                        break;
                    }
                }
            }
            let _ = bus.close_conn(&connsid_for_read).await;
        });

        Ok(())
    }

    pub async fn close_conn(&self, connsid: &str) -> BusResult<()> {
        let conn = self.inner.conns.write().await.remove(connsid);
        self.inner.conn_transport.write().await.remove(connsid);
        if let Some(conn) = conn {
            conn.close().await;
        }
        Ok(())
    }

    /// Re-sends the welcome message to every currently open connection,
    /// bypassing the per-transport outbound queue since this is a direct
    /// broadcast rather than a targeted reply. Send failures are logged
    /// and do not fail the registration call that triggered them
    ///
    async fn broadcast_welcome(&self) {
        let Some(bodycodeid) = self.inner.registry.read().await.id_of(Welcome::CODE) else {
            return;
        };
        let welcome = Welcome {
            codes: self.inner.registry.read().await.codes_in_order().to_vec(),
        };
        let Ok(body) = serde_json::to_value(&welcome) else {
            return;
        };
        let conns: Vec<Arc<dyn Connection>> = self.inner.conns.read().await.values().cloned().collect();
        for conn in conns {
            let rmsg = Rmsg {
                sid: Uuid::new_v4().to_string(),
                lsid: None,
                bodycodeid,
                body: body.clone(),
            };
            if let Err(e) = conn.send(&rmsg).await {
                warn!(connsid = conn.connsid(), error = %e, "failed to re-send welcome");
            }
        }
    }

    // -- RPC dispatch entry point -----------------------------------------

    /// Spawns one self-removing task per RPC request, tracked in
    /// `rpc_tasks` so `destroy` can abort any still in flight. The task
    /// removes its own entry on completion rather than relying on a
    /// caller to reap it.
    async fn spawn_rpc_task(&self, state: CtxState, bus: Bus, rmsid: String, body: serde_json::Value) {
        let task_id = self.inner.rpc_task_counter.fetch_add(1, Ordering::SeqCst);
        let tasks = self.inner.rpc_tasks.clone();
        let handle = tokio::spawn(async move {
            Ctx::scope(state, || async move {
                match serde_json::from_value::<SrpcSend>(body) {
                    Ok(call) => bus.handle_rpc(call, &rmsid).await,
                    Err(e) => warn!(error = %e, "malformed srpc_send body"),
                }
            })
            .await;
            tasks.write().await.remove(&task_id);
        });
        self.inner.rpc_tasks.write().await.insert(task_id, handle);
    }

    async fn handle_rpc(&self, call: SrpcSend, msid: &str) {
        let ctxfn = self.inner.rpc_ctxfn.read().await.clone();
        let _guard = ctxfn.map(|f| f());

        let result = self.inner.rpc.dispatch(&call.key, call.body).await;
        let value = match result {
            Ok(value) => value,
            Err(err) => serde_json::to_value(&err).unwrap_or(serde_json::Value::Null),
        };

        // Bypasses `pub_opts`'s SrpcSend/SrpcRecv guard deliberately: that
        // guard exists to stop callers impersonating an rpc reply through
        // the public API, not the dispatcher's own reply path -- this
        // publishes directly onto the network, skipping in-process
        // subscribers entirely.
        let sid = Uuid::new_v4().to_string();
        let opts = PubOpts::new().net_only();
        if let Err(e) = self
            .publish_value_with_sid(SrpcRecv::CODE, value, &sid, Some(msid.to_string()), &opts)
            .await
        {
            warn!(error = %e, "failed to publish rpc reply");
        }
        // _guard drops here, after the handler call and reply publish.
    }

    async fn run_dispatcher(&self, mut rx: mpsc::Receiver<InboundEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let code = self
                .inner
                .registry
                .read()
                .await
                .code_of(envelope.rmsg.bodycodeid)
                .map(str::to_string);
            let Some(code) = code else {
                warn!(
                    connsid = %envelope.connsid,
                    bodycodeid = envelope.rmsg.bodycodeid,
                    "dropping inbound message with unregistered codeid"
                );
                continue;
            };

            let state = CtxState {
                msid: Some(envelope.rmsg.sid.clone()),
                connsid: Some(envelope.connsid.clone()),
                subfn_lsid: None,
            };

            let bus = self.clone();
            let rmsg_sid = envelope.rmsg.sid.clone();
            let body = envelope.rmsg.body.clone();

            if code == SrpcSend::CODE {
                // Spawned rather than awaited inline: an RPC handler can
                // take arbitrarily long (it may itself call out over the
                // network), and blocking here would stall every other
                // inbound message across every transport, not just this
                // one connection's.
                self.spawn_rpc_task(state, bus, rmsg_sid, body).await;
                continue;
            }

            if code == SrpcRecv::CODE {
                // The server hosts RPC handlers, it is not itself an RPC
                // client, so an inbound `SrpcRecv` has no waiter to serve
                // except the linked-sid reply path below.
                debug!(connsid = %envelope.connsid, "dropping inbound srpc_recv, server is not an rpc client");
                continue;
            }

            // A reply to a pending `publish_request` network waiter.
            if let Some(lsid) = &envelope.rmsg.lsid {
                let waiter = self.inner.waiters.write().await.remove(lsid);
                if let Some(tx) = waiter {
                    let msg = BusMsg {
                        sid: envelope.rmsg.sid.clone(),
                        lsid: envelope.rmsg.lsid.clone(),
                        code,
                        body: envelope.rmsg.body.clone(),
                    };
                    let _ = tx.send(msg);
                    continue;
                }
            }

            let msg = BusMsg {
                sid: envelope.rmsg.sid.clone(),
                lsid: envelope.rmsg.lsid.clone(),
                code,
                body: envelope.rmsg.body.clone(),
            };
            Ctx::scope(state, || async move {
                self.dispatch_to_subs(&msg).await;
            })
            .await;
        }
    }
}
