use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use bridge_app::status::{self, StatusState};
use bridge_app::BridgeConfig;
use bus_peripheral::{tunnel, BusPeripheral};
use device_registry::{ControlMode, DeviceRegistry};
use pin_sync::{PinSync, SysfsPins};
use plug_client::HttpPlugTransport;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Args {
    config_path: Option<String>,
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    let config = BridgeConfig::load_with_path(args.config_path).context("load config failed")?;

    if args.print_config {
        println!("{}", serde_json::to_string(&config.probe_document())?);
        return Ok(());
    }

    config.validate().context("config validation failed")?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_filter()?)
        .init();
    for note in config.advisories() {
        warn!("{note}");
    }

    let registry = DeviceRegistry::build(&config.plugs, config.mode).context("plug table")?;
    registry.log_table();
    let transport =
        HttpPlugTransport::new(config.transport.clone()).context("http client init failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks: JoinSet<Result<&'static str>> = JoinSet::new();

    if let Some(ref addr) = config.metrics_addr {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("metrics recorder install failed")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind status server on {addr}"))?;
        let state = StatusState {
            metrics: Some(handle),
            probe: Arc::new(config.probe_document()),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            status::serve(listener, state, shutdown)
                .await
                .context("status server failed")?;
            Ok("status server")
        });
    }

    metrics::gauge!("bridge_plugs_configured").set(registry.addresses().len() as f64);

    match config.mode {
        ControlMode::Bus => {
            let peripheral = BusPeripheral::new(registry, transport);
            let handle = peripheral.handle();
            let interval = Duration::from_millis(config.bus.service_interval_ms);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                peripheral.run(interval, shutdown).await;
                Ok("bus peripheral")
            });

            let listener = TcpListener::bind(&config.bus.tunnel_listen)
                .await
                .with_context(|| format!("bind bus tunnel on {}", config.bus.tunnel_listen))?;
            let address = config.bus.address;
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                tunnel::serve(listener, handle, address, shutdown)
                    .await
                    .context("bus tunnel failed")?;
                Ok("bus tunnel")
            });
            info!(address = format_args!("{address:#04x}"), "bus mode enabled");
        }
        ControlMode::Pins => {
            let pins = SysfsPins::new(&config.pins.sysfs_base_path);
            for (address, endpoint) in registry.endpoints() {
                if let Some(pin) = endpoint.control_pin {
                    if let Err(err) = pins.prepare_input(pin).await {
                        warn!(address = %address, pin, error = %err, "gpio setup failed");
                    }
                }
            }
            let mut sync = PinSync::new(registry, transport, pins);
            let interval = Duration::from_millis(config.pins.poll_interval_ms);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                sync.run(interval, shutdown).await;
                Ok("pin sync")
            });
            info!("pin control enabled");
        }
    }

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "signal handler failed");
            }
            info!("shutdown signal received");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(name)) => warn!(task = name, "task exited early"),
                Ok(Err(err)) => warn!(error = %err, "task failed"),
                Err(err) => warn!(error = %err, "task join failed"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let drain = async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(name)) => info!(task = name, "task stopped"),
                Ok(Err(err)) => warn!(error = %err, "task failed during shutdown"),
                Err(err) => warn!(error = %err, "task join failed"),
            }
        }
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("tasks did not stop in time, aborting");
        tasks.abort_all();
    }

    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn parse_args() -> Args {
    let mut parsed = Args {
        config_path: None,
        print_config: false,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            parsed.config_path = args.next();
        } else if let Some(path) = arg.strip_prefix("--config=") {
            parsed.config_path = Some(path.to_string());
        } else if arg == "--print-config" {
            parsed.print_config = true;
        }
    }
    parsed
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
