//! Drives a bridge over the TCP bus tunnel.
//!
//! ```text
//! plug-master [--connect HOST:PORT] [--address 0x35] [--timeout-ms N] <on|off|rssi|energy> <group> <sub>
//! ```

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;

use bridge_app::parse_bus_address;
use bus_master::{BusMaster, MasterConfig, TunnelLink};
use types::describe_code;

const DEFAULT_CONNECT: &str = "127.0.0.1:7035";

#[derive(Debug)]
struct Invocation {
    connect: String,
    config: MasterConfig,
    action: String,
    group: u8,
    sub: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::WARN)
        .with_writer(std::io::stderr)
        .init();

    let invocation = parse_args(env::args().skip(1).collect())?;
    let link = TunnelLink::connect(invocation.connect.as_str())
        .await
        .with_context(|| format!("connect to {}", invocation.connect))?;
    let mut master = BusMaster::new(link, invocation.config);
    let (group, sub) = (invocation.group, invocation.sub);

    let outcome = match invocation.action.as_str() {
        "on" => master.power_on(group, sub).await.map(|()| "on".to_string()),
        "off" => master.power_off(group, sub).await.map(|()| "off".to_string()),
        "rssi" => master.rssi(group, sub).await.map(|rssi| format!("rssi {rssi}%")),
        "energy" => match master.energy(group, sub).await {
            Ok(sample) => Ok(serde_json::to_string(&sample)?),
            Err(err) => Err(err),
        },
        other => anyhow::bail!("unknown action {other}"),
    };

    match outcome {
        Ok(line) => {
            println!("{line}");
            Ok(())
        }
        Err(err) => {
            let code = err.code();
            anyhow::bail!("{group}/{sub}: {err} [{code}: {}]", describe_code(code))
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<Invocation> {
    let mut connect = DEFAULT_CONNECT.to_string();
    let mut config = MasterConfig::default();
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--connect" => connect = args.next().context("--connect needs HOST:PORT")?,
            "--address" => {
                let value = args.next().context("--address needs a value")?;
                config.address =
                    parse_bus_address(&value).with_context(|| format!("bad bus address {value}"))?;
            }
            "--timeout-ms" => {
                let value = args.next().context("--timeout-ms needs a value")?;
                let ms: u64 = value.parse().with_context(|| format!("bad timeout {value}"))?;
                config.response_timeout = Duration::from_millis(ms);
            }
            _ => positional.push(arg),
        }
    }

    let [action, group, sub] = <[String; 3]>::try_from(positional)
        .map_err(|_| anyhow::anyhow!("usage: plug-master [options] <on|off|rssi|energy> <group> <sub>"))?;
    Ok(Invocation {
        connect,
        config,
        action,
        group: group.parse().with_context(|| format!("bad group {group}"))?,
        sub: sub.parse().with_context(|| format!("bad sub {sub}"))?,
    })
}
