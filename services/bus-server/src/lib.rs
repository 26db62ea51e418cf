//! Minimal websocket transport binary for `msgbus`: accepts connections
//! at `/ws`, hands each to the bus via [`connection::WebSocketConnection`],
//! and registers a handful of example subscribers/an RPC handler so the
//! wiring has something to demonstrate end to end.

pub mod connection;
pub mod demo;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use msgbus::{Bus, BusConfig, BusResult, TransportConfig};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use connection::WebSocketConnection;

pub const WS_CONN_TYPE: &str = "ws";

/// Builds a running bus: registers the `ws` transport and every demo
/// type/subscriber/RPC handler.
pub async fn build_bus() -> BusResult<Bus> {
    let bus = Bus::init(BusConfig::new());
    bus.reg_transport(TransportConfig::server(WS_CONN_TYPE))
        .await?;
    demo::install(&bus).await?;
    Ok(bus)
}

/// Builds the axum router serving the `/ws` upgrade endpoint.
pub fn build_router(bus: Bus) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(bus)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(bus): State<Bus>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let connsid = Uuid::new_v4().to_string();
        info!(connsid, "accepting websocket connection");
        let connection: Arc<WebSocketConnection> =
            WebSocketConnection::spawn(socket, connsid.clone());
        if let Err(e) = bus.conn(WS_CONN_TYPE, connection).await {
            tracing::warn!(connsid, error = %e, "failed to register connection with bus");
        }
    })
}
