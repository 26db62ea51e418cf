//! Ambient per-dispatch context.
//!
//! A subfn's signature takes only its body, not a context parameter, so
//! anything it needs to know about the message it's reacting to (which
//! message triggered it, which connection it came in on) is threaded here
//! instead, scoped narrowly around the single subfn/RPC-handler call that's
//! allowed to see it. Internal `Bus` methods still take an explicit `Ctx`
//! where it matters (e.g. computing a reply's default lsid) rather than
//! reaching for this from deep inside unrelated code paths.

use std::cell::RefCell;

use tokio::task_local;

/// Snapshot of the ambient context, installed once per inbound dispatch.
#[derive(Debug, Clone, Default)]
pub struct CtxState {
    /// sid of the message currently being handled, if any.
    pub msid: Option<String>,
    /// connsid the triggering message arrived on, if any.
    pub connsid: Option<String>,
    /// Override for the lsid a subfn's own published retvals should carry.
    pub subfn_lsid: Option<String>,
}

task_local! {
    static CTX: RefCell<CtxState>;
}

/// Accessors for the ambient context. All of these return `None` outside of
/// a `Ctx::scope` — there is no ambient context at the top level.
pub struct Ctx;

impl Ctx {
    pub fn msid() -> Option<String> {
        CTX.try_with(|c| c.borrow().msid.clone()).unwrap_or(None)
    }

    pub fn connsid() -> Option<String> {
        CTX.try_with(|c| c.borrow().connsid.clone())
            .unwrap_or(None)
    }

    pub fn subfn_lsid() -> Option<String> {
        CTX.try_with(|c| c.borrow().subfn_lsid.clone())
            .unwrap_or(None)
    }

    /// Overrides the lsid this subfn's own published retvals will carry.
    /// Without a call to this, a retval's lsid defaults to the ambient
    /// `msid` (i.e. it threads as a reply to the triggering message).
    pub fn set_subfn_lsid(lsid: impl Into<String>) {
        let _ = CTX.try_with(|c| c.borrow_mut().subfn_lsid = Some(lsid.into()));
    }

    /// Runs `f` with `state` installed as the ambient context for the
    /// duration of the returned future.
    pub(crate) async fn scope<F, Fut>(state: CtxState, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future,
    {
        CTX.scope(RefCell::new(state), f()).await
    }

    /// A full copy of the ambient context, or the default (all-`None`)
    /// state outside of a `scope`. Backs `Bus::get_ctx`.
    pub fn snapshot() -> CtxState {
        CTX.try_with(|c| c.borrow().clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accessors_are_none_outside_a_scope() {
        assert_eq!(Ctx::msid(), None);
        assert_eq!(Ctx::connsid(), None);
    }

    #[tokio::test]
    async fn scope_installs_msid_and_connsid() {
        let state = CtxState {
            msid: Some("m1".to_string()),
            connsid: Some("c1".to_string()),
            subfn_lsid: None,
        };
        Ctx::scope(state, || async {
            assert_eq!(Ctx::msid(), Some("m1".to_string()));
            assert_eq!(Ctx::connsid(), Some("c1".to_string()));
        })
        .await;
        assert_eq!(Ctx::msid(), None);
    }

    #[tokio::test]
    async fn set_subfn_lsid_is_visible_within_the_same_scope() {
        Ctx::scope(CtxState::default(), || async {
            assert_eq!(Ctx::subfn_lsid(), None);
            Ctx::set_subfn_lsid("override");
            assert_eq!(Ctx::subfn_lsid(), Some("override".to_string()));
        })
        .await;
    }
}
