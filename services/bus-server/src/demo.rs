//! Example message types and handlers wired up at startup to demonstrate
//! the bus end to end: one subscriber that echoes a message back to its
//! own sender, one subscriber that re-broadcasts to every open connection,
//! and one RPC handler.

use std::time::{SystemTime, UNIX_EPOCH};

use bus_protocol::{Coded, ErrorBody, error_kind};
use msgbus::{Bus, BusResult, PubOpts, SubFnRetval};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub text: String,
}

impl Coded for Echo {
    const CODE: &'static str = "demo::echo";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub text: String,
}

impl Coded for Announcement {
    const CODE: &'static str = "demo::announcement";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub nonce: u64,
}

impl Coded for PingRequest {
    const CODE: &'static str = "demo::ping_request";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub nonce: u64,
    pub served_at_epoch_ms: u128,
}

impl Coded for PingResponse {
    const CODE: &'static str = "demo::ping_response";
}

fn now_epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis()
}

/// Registers every demo type, a couple of example subscribers, and one
/// RPC handler against `bus`.
pub async fn install(bus: &Bus) -> BusResult<()> {
    bus.reg_type::<Echo>().await?;
    bus.reg_type::<Announcement>().await?;
    bus.reg_type::<PingRequest>().await?;
    bus.reg_type::<PingResponse>().await?;

    bus.sub::<Echo, _, _>(|echo: Echo| async move {
        info!(text = %echo.text, "echoing message back to sender");
        SubFnRetval::ok(Echo { text: echo.text })
            .unwrap_or_else(|e| SubFnRetval::err(error_kind::INTERNAL, e.to_string()))
    })
    .await?;

    let broadcast_bus = bus.clone();
    bus.sub::<Announcement, _, _>(move |announcement: Announcement| {
        let bus = broadcast_bus.clone();
        async move {
            let targets = bus.connsids().await;
            if let Err(e) = bus
                .pub_opts(
                    Announcement {
                        text: announcement.text,
                    },
                    PubOpts::new().to(targets).net_only(),
                )
                .await
            {
                tracing::warn!(error = %e, "failed to re-broadcast announcement");
            }
            SubFnRetval::Skip
        }
    })
    .await?;

    bus.reg_rpc::<PingRequest, PingResponse, _, _>("demo::ping", |req: PingRequest| async move {
        if req.nonce == 0 {
            return Err(ErrorBody::new(error_kind::VALUE, "nonce must be non-zero"));
        }
        Ok(PingResponse {
            nonce: req.nonce,
            served_at_epoch_ms: now_epoch_ms(),
        })
    })
    .await?;

    Ok(())
}
