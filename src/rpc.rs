use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bus_protocol::{Coded, ErrorBody, error_kind};
use tokio::sync::RwLock;

use crate::error::{BusError, BusResult};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ErasedHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<Result<serde_json::Value, ErrorBody>> + Send + Sync>;

/// Handlers registered via `Bus::reg_rpc`, keyed by their registration key
/// (not by function name -- Rust has no runtime reflection to recover a
/// stripped `srpc__` prefix from, unlike the original's name-derived keys;
/// callers always supply the key explicitly).
#[derive(Default)]
pub struct RpcRegistry {
    handlers: RwLock<HashMap<String, ErasedHandler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed handler under `key`. A second registration of the
    /// same key is rejected rather than replacing the first.
    pub async fn register<T, R, F, Fut>(&self, key: impl Into<String>, handler: F) -> BusResult<()>
    where
        T: Coded,
        R: Coded,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorBody>> + Send + 'static,
    {
        let key = key.into();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&key) {
            return Err(BusError::DuplicateRpcKey(key));
        }

        // `handler` must be cloned into each call's future rather than
        // borrowed, since the erased closure below only gets `&self`
        // access per call but must produce a `'static` boxed future.
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |value: serde_json::Value| {
            let handler = handler.clone();
            Box::pin(async move {
                let body: T = serde_json::from_value(value)
                    .map_err(|e| ErrorBody::new(error_kind::VALUE, e.to_string()))?;
                let retval = handler(body).await?;
                serde_json::to_value(&retval)
                    .map_err(|e| ErrorBody::new(error_kind::INTERNAL, e.to_string()))
            })
        });
        handlers.insert(key, erased);
        Ok(())
    }

    pub async fn has(&self, key: &str) -> bool {
        self.handlers.read().await.contains_key(key)
    }

    pub async fn dispatch(
        &self,
        key: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ErrorBody> {
        let handler = self.handlers.read().await.get(key).cloned();
        match handler {
            Some(handler) => handler(body).await,
            None => Err(ErrorBody::new(
                error_kind::UNREGISTERED_CODE,
                format!("no rpc handler registered for `{key}`"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_protocol::Ok as BusOk;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }
    impl Coded for Ping {
        const CODE: &'static str = "app::ping";
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Pong {
        n: u32,
    }
    impl Coded for Pong {
        const CODE: &'static str = "app::pong";
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_handler() {
        let rpc = RpcRegistry::new();
        rpc.register("ping", |req: Ping| async move { Ok(Pong { n: req.n + 1 }) })
            .await
            .unwrap();

        let result = rpc
            .dispatch("ping", serde_json::json!({"n": 41}))
            .await
            .unwrap();
        let pong: Pong = serde_json::from_value(result).unwrap();
        assert_eq!(pong, Pong { n: 42 });
    }

    #[tokio::test]
    async fn second_registration_of_the_same_key_is_rejected() {
        let rpc = RpcRegistry::new();
        rpc.register("ping", |req: Ping| async move { Ok(Pong { n: req.n }) })
            .await
            .unwrap();
        let err = rpc
            .register("ping", |req: Ping| async move { Ok(Pong { n: req.n }) })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateRpcKey(k) if k == "ping"));
    }

    #[tokio::test]
    async fn unknown_key_produces_an_unregistered_code_error() {
        let rpc = RpcRegistry::new();
        let err = rpc
            .dispatch("nope", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind, error_kind::UNREGISTERED_CODE);
    }

    #[tokio::test]
    async fn malformed_body_produces_a_value_error_not_a_panic() {
        let rpc = RpcRegistry::new();
        rpc.register("ping", |req: Ping| async move { Ok(Pong { n: req.n }) })
            .await
            .unwrap();
        let err = rpc
            .dispatch("ping", serde_json::json!({"wrong_field": true}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, error_kind::VALUE);
    }

    #[tokio::test]
    async fn handler_can_return_ok_sentinel() {
        let rpc = RpcRegistry::new();
        rpc.register("noop", |_: Ping| async move { Ok(BusOk::default()) })
            .await
            .unwrap();
        let result = rpc
            .dispatch("noop", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({}));
    }
}
