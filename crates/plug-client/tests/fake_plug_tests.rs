use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use plug_client::{ClientConfig, HttpPlugTransport, PlugError, PlugTarget, PlugTransport};
use types::PowerState;

#[derive(Default)]
struct FakePlug {
    relays: Mutex<[bool; 4]>,
    commands: Mutex<Vec<String>>,
}

async fn cm(
    State(plug): State<Arc<FakePlug>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let command = params.get("cmnd").cloned().unwrap_or_default();
    plug.commands.lock().expect("commands").push(command.clone());

    let (verb, arg) = match command.split_once(' ') {
        Some((verb, arg)) => (verb.to_string(), Some(arg.to_string())),
        None => (command.clone(), None),
    };

    match (verb.as_str(), arg.as_deref()) {
        ("Status", Some("10")) => (
            StatusCode::OK,
            r#"{"StatusSNS":{"ENERGY":{"Total":12.3,"Yesterday":1.1,"Today":0.4,"Power":60,"Voltage":120.1,"Current":0.5}}}"#
                .to_string(),
        ),
        ("Status", Some("11")) => (
            StatusCode::OK,
            r#"{"StatusSTS":{"POWER":"OFF","Wifi":{"RSSI":64,"Signal":-68}}}"#.to_string(),
        ),
        (power, arg) if power.starts_with("Power") => {
            let relay: usize = power.trim_start_matches("Power").parse().unwrap_or(1);
            let mut relays = plug.relays.lock().expect("relays");
            match arg {
                Some("On") => relays[relay - 1] = true,
                Some("Off") => relays[relay - 1] = false,
                _ => {}
            }
            let field = if power == "Power" {
                "POWER".to_string()
            } else {
                format!("POWER{relay}")
            };
            let state = if relays[relay - 1] { "ON" } else { "OFF" };
            (StatusCode::OK, format!(r#"{{"{field}":"{state}"}}"#))
        }
        _ => (StatusCode::OK, r#"{"Command":"Unknown"}"#.to_string()),
    }
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

async fn spawn_fake_plug() -> (SocketAddr, Arc<FakePlug>) {
    let plug = Arc::new(FakePlug::default());
    let router = Router::new().route("/cm", get(cm)).with_state(plug.clone());
    (spawn(router).await, plug)
}

fn transport_for(addr: SocketAddr, timeout_ms: u64) -> HttpPlugTransport {
    HttpPlugTransport::new(ClientConfig {
        timeout_ms,
        port: Some(addr.port()),
    })
    .expect("client")
}

fn local_target(relay: Option<u16>) -> PlugTarget {
    PlugTarget {
        base_url: "http://127.0.0.1".to_string(),
        relay,
    }
}

#[tokio::test]
async fn set_then_query_power() {
    let (addr, plug) = spawn_fake_plug().await;
    let transport = transport_for(addr, 2_000);
    let target = local_target(None);

    assert_eq!(transport.query_power(&target).await.expect("query"), PowerState::Off);
    transport.set_power(&target, true).await.expect("set on");
    assert_eq!(transport.query_power(&target).await.expect("query"), PowerState::On);
    transport.set_power(&target, false).await.expect("set off");

    let commands = plug.commands.lock().expect("commands").clone();
    assert_eq!(commands, vec!["Power", "Power On", "Power", "Power Off"]);
}

#[tokio::test]
async fn relay_commands_are_indexed() {
    let (addr, plug) = spawn_fake_plug().await;
    let transport = transport_for(addr, 2_000);
    let target = local_target(Some(2));

    transport.set_power(&target, true).await.expect("set on");
    assert_eq!(transport.query_power(&target).await.expect("query"), PowerState::On);
    assert_eq!(
        transport.query_power(&local_target(Some(1))).await.expect("query"),
        PowerState::Off
    );

    let commands = plug.commands.lock().expect("commands").clone();
    assert_eq!(commands[0], "Power2 On");
}

#[tokio::test]
async fn rssi_and_energy_queries() {
    let (addr, _plug) = spawn_fake_plug().await;
    let transport = transport_for(addr, 2_000);
    let target = local_target(None);

    assert_eq!(transport.query_rssi(&target).await.expect("rssi"), 64);
    let sample = transport.query_energy(&target).await.expect("energy");
    assert_eq!(sample.voltage, 120.1);
    assert_eq!(sample.power, 60.0);
    assert_eq!(sample.total, 12.3);
}

#[tokio::test]
async fn http_error_status_is_transport_failure() {
    let router = Router::new().route(
        "/cm",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }),
    );
    let addr = spawn(router).await;
    let transport = transport_for(addr, 2_000);

    let err = transport
        .set_power(&local_target(None), true)
        .await
        .expect_err("status");
    assert!(matches!(err, PlugError::Status(500)));
    assert!(!err.is_decode());
}

#[tokio::test]
async fn garbage_body_is_decode_failure() {
    let router = Router::new().route("/cm", get(|| async { "<html>not tasmota</html>" }));
    let addr = spawn(router).await;
    let transport = transport_for(addr, 2_000);

    let err = transport
        .query_energy(&local_target(None))
        .await
        .expect_err("decode");
    assert!(err.is_decode());

    // set_power never looks at the body
    transport
        .set_power(&local_target(None), false)
        .await
        .expect("set ignores body");
}

#[tokio::test]
async fn slow_plug_times_out() {
    let router = Router::new().route(
        "/cm",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            r#"{"POWER":"ON"}"#
        }),
    );
    let addr = spawn(router).await;
    let transport = transport_for(addr, 50);

    let err = transport
        .query_power(&local_target(None))
        .await
        .expect_err("timeout");
    assert!(matches!(err, PlugError::Timeout { timeout_ms: 50 }));
}

#[tokio::test]
async fn refused_connection_is_transport_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let transport = transport_for(addr, 2_000);

    let err = transport
        .query_rssi(&local_target(None))
        .await
        .expect_err("refused");
    assert!(matches!(err, PlugError::Transport(_)));
}
