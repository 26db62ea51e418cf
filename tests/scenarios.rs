use std::time::Duration;

use bus_test_support::in_memory_pair;
use msgbus::{
    error_kind, Bus, BusConfig, BusError, Coded, ErrorBody, PubOpts, Rmsg, SrpcSend, SubFnRetval,
    TransportConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TA {
    value: i32,
}
impl Coded for TA {
    const CODE: &'static str = "app::ta";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TB {
    value: i32,
}
impl Coded for TB {
    const CODE: &'static str = "app::tb";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddArgs {
    a: i32,
    b: i32,
}
impl Coded for AddArgs {
    const CODE: &'static str = "app::add_args";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sum {
    s: i32,
}
impl Coded for Sum {
    const CODE: &'static str = "app::sum";
}

async fn bus_with_transport() -> Bus {
    let bus = Bus::init(BusConfig::new());
    bus.reg_transport(TransportConfig::server("t")).await.unwrap();
    bus
}

#[tokio::test]
async fn s1_welcome_lists_reserved_then_caller_codes_in_order() {
    let bus = bus_with_transport().await;
    bus.reg_type::<TA>().await.unwrap();
    bus.reg_type::<TB>().await.unwrap();

    let (conn, peer) = in_memory_pair("c1");
    bus.conn("t", conn).await.unwrap();

    let welcome = peer.recv_from_bus().await.unwrap();
    assert_eq!(welcome.bodycodeid, 0);
    let body = welcome.body.get("codes").unwrap().as_array().unwrap();
    let codes: Vec<String> = body
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        codes,
        vec![
            "bus::welcome",
            "bus::ok",
            "bus::error",
            "bus::srpc_send",
            "bus::srpc_recv",
            "app::ta",
            "app::tb",
        ]
    );
}

#[tokio::test]
async fn s2_echo_subscribe_replies_with_linked_sid() {
    let bus = bus_with_transport().await;
    bus.reg_type::<TA>().await.unwrap();
    bus.sub::<TA, _, _>(|x: TA| async move {
        SubFnRetval::ok(TA { value: x.value + 1 }).unwrap()
    })
    .await
    .unwrap();

    let (conn, peer) = in_memory_pair("c1");
    bus.conn("t", conn).await.unwrap();
    let _welcome = peer.recv_from_bus().await.unwrap();

    let ta_codeid = bus.type_id_of(TA::CODE).await.unwrap();
    peer.send_to_bus(Rmsg {
        sid: "m1".to_string(),
        lsid: None,
        bodycodeid: ta_codeid,
        body: serde_json::json!({"value": 41}),
    })
    .await;

    let reply = peer.recv_from_bus().await.unwrap();
    assert_eq!(reply.lsid.as_deref(), Some("m1"));
    assert_eq!(reply.bodycodeid, ta_codeid);
    let body: TA = serde_json::from_value(reply.body).unwrap();
    assert_eq!(body.value, 42);
}

#[tokio::test]
async fn s3_error_reply_carries_linked_sid() {
    let bus = bus_with_transport().await;
    bus.reg_type::<TA>().await.unwrap();
    bus.sub::<TA, _, _>(|x: TA| async move {
        if x.value == 0 {
            SubFnRetval::err(error_kind::VALUE, "value must be non-zero")
        } else {
            SubFnRetval::ok(TA { value: x.value }).unwrap()
        }
    })
    .await
    .unwrap();

    let (conn, peer) = in_memory_pair("c1");
    bus.conn("t", conn).await.unwrap();
    let _welcome = peer.recv_from_bus().await.unwrap();

    let ta_codeid = bus.type_id_of(TA::CODE).await.unwrap();
    let error_codeid = bus.type_id_of(ErrorBody::CODE).await.unwrap();
    peer.send_to_bus(Rmsg {
        sid: "m2".to_string(),
        lsid: None,
        bodycodeid: ta_codeid,
        body: serde_json::json!({"value": 0}),
    })
    .await;

    let reply = peer.recv_from_bus().await.unwrap();
    assert_eq!(reply.lsid.as_deref(), Some("m2"));
    assert_eq!(reply.bodycodeid, error_codeid);
    let body: ErrorBody = serde_json::from_value(reply.body).unwrap();
    assert_eq!(body.kind, error_kind::VALUE);
}

#[tokio::test]
async fn s4_rpc_round_trip() {
    let bus = bus_with_transport().await;
    bus.reg_rpc::<AddArgs, Sum, _, _>("add", |args: AddArgs| async move {
        Ok(Sum { s: args.a + args.b })
    })
    .await
    .unwrap();

    let (conn, peer) = in_memory_pair("c1");
    bus.conn("t", conn).await.unwrap();
    let _welcome = peer.recv_from_bus().await.unwrap();

    let srpc_send_codeid = bus.type_id_of(SrpcSend::CODE).await.unwrap();
    let call = SrpcSend {
        key: "add".to_string(),
        body: serde_json::json!({"a": 2, "b": 3}),
    };
    peer.send_to_bus(Rmsg {
        sid: "r1".to_string(),
        lsid: None,
        bodycodeid: srpc_send_codeid,
        body: serde_json::to_value(&call).unwrap(),
    })
    .await;

    let reply = peer.recv_from_bus().await.unwrap();
    assert_eq!(reply.lsid.as_deref(), Some("r1"));
    let body: Sum = serde_json::from_value(reply.body).unwrap();
    assert_eq!(body.s, 5);
}

#[tokio::test]
async fn s5_publish_request_times_out_with_no_waiter_served() {
    let bus = Bus::init(BusConfig::new());
    bus.reg_type::<TA>().await.unwrap();

    let result = bus
        .publish_request::<TA, TA>(
            TA { value: 1 },
            Duration::from_millis(50),
            PubOpts::new().to(["c-none"]),
        )
        .await;
    assert!(matches!(result, Err(BusError::RpcTimeout(_))));
}

#[tokio::test]
async fn s6_reg_types_triggers_re_welcome_to_open_connections() {
    let bus = bus_with_transport().await;
    bus.reg_type::<TA>().await.unwrap();

    let (conn, peer) = in_memory_pair("c1");
    bus.conn("t", conn).await.unwrap();
    let first_welcome = peer.recv_from_bus().await.unwrap();
    let first_codes = first_welcome.body.get("codes").unwrap().as_array().unwrap();
    assert!(!first_codes
        .iter()
        .any(|v| v.as_str() == Some("app::tnew")));

    bus.reg_types(&["app::tnew"]).await.unwrap();

    let second_welcome = peer.recv_from_bus().await.unwrap();
    assert_eq!(second_welcome.bodycodeid, 0);
    let second_codes = second_welcome
        .body
        .get("codes")
        .unwrap()
        .as_array()
        .unwrap();
    let position = second_codes
        .iter()
        .position(|v| v.as_str() == Some("app::tnew"))
        .expect("app::tnew should be present in the updated welcome");
    assert_eq!(position, second_codes.len() - 1);
}
