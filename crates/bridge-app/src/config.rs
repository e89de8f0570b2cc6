use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::level_filters::LevelFilter;

use bus_peripheral::{PRIMARY_ADDRESS, SECONDARY_ADDRESS};
use device_registry::{ControlMode, DeviceRegistry, PlugConfig};
use plug_client::ClientConfig;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_AP_NAME: &str = "plugAP0000";
const DEFAULT_TUNNEL_LISTEN: &str = "0.0.0.0:7035";
const DEFAULT_SERVICE_INTERVAL_MS: u64 = 50;
const DEFAULT_PIN_POLL_INTERVAL_MS: u64 = 50;

#[derive(Clone, Debug)]
pub struct BusSettings {
    pub address: u8,
    pub tunnel_listen: String,
    pub service_interval_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            address: PRIMARY_ADDRESS,
            tunnel_listen: DEFAULT_TUNNEL_LISTEN.to_string(),
            service_interval_ms: DEFAULT_SERVICE_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PinSettings {
    pub sysfs_base_path: String,
    pub poll_interval_ms: u64,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            sysfs_base_path: pin_sync::sysfs::DEFAULT_BASE_PATH.to_string(),
            poll_interval_ms: DEFAULT_PIN_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub mode: ControlMode,
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub log_level: String,
    /// Access-point name reported with the plug configuration.
    pub ap_name: String,
    pub plugs: PlugConfig,
    /// JSON plug document; replaces `plugs` when set.
    pub plugs_file: Option<String>,
    pub transport: ClientConfig,
    pub bus: BusSettings,
    pub pins: PinSettings,
    pub metrics_addr: Option<String>,
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config)?;

        if let Some(path) = config.plugs_file.clone() {
            config.plugs = load_plug_document(&path)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.log_filter()?;
        if self.ap_name.trim().is_empty() {
            anyhow::bail!("ap_name must be non-empty");
        }
        if self.transport.timeout_ms == 0 {
            anyhow::bail!("transport.timeout_ms must be >= 1");
        }
        if self.transport.port == Some(0) {
            anyhow::bail!("transport.port must be between 1 and 65535 when set");
        }
        if self.bus.address == 0 || self.bus.address > 0x7f {
            anyhow::bail!("bus.address must be a 7-bit address");
        }
        self.bus
            .tunnel_listen
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("bus.tunnel_listen must be host:port"))?;
        if self.bus.service_interval_ms == 0 {
            anyhow::bail!("bus.service_interval_ms must be >= 1");
        }
        if self.pins.poll_interval_ms == 0 {
            anyhow::bail!("pins.poll_interval_ms must be >= 1");
        }
        if self.pins.sysfs_base_path.trim().is_empty() {
            anyhow::bail!("pins.sysfs_base_path must be non-empty");
        }
        if let Some(ref addr) = self.metrics_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("metrics_addr must be host:port when set"))?;
        }

        DeviceRegistry::build(&self.plugs, self.mode)
            .map_err(|err| anyhow::anyhow!("plugs: {err}"))?;
        Ok(())
    }

    /// Settings that are valid but unusual; logged once tracing is up.
    pub fn advisories(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.bus.address != PRIMARY_ADDRESS && self.bus.address != SECONDARY_ADDRESS {
            notes.push(format!(
                "bus.address {:#04x} is neither {PRIMARY_ADDRESS:#04x} nor {SECONDARY_ADDRESS:#04x}",
                self.bus.address
            ));
        }
        notes
    }

    pub fn log_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| anyhow::anyhow!("log_level must be off, error, warn, info, debug or trace"))
    }

    /// The plug configuration as reported to a probing host.
    pub fn probe_document(&self) -> serde_json::Value {
        json!({
            "plugApMac4": self.ap_name,
            "SPI_controlMode": self.mode == ControlMode::Bus,
            "esp_pin_map": self.plugs.pins,
            "plug_ip": self.plugs.ip_octets,
            "plugs_per_ip": self.plugs.plugs_per_ip,
        })
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: ControlMode::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            ap_name: DEFAULT_AP_NAME.to_string(),
            plugs: PlugConfig::default(),
            plugs_file: None,
            transport: ClientConfig::default(),
            bus: BusSettings::default(),
            pins: PinSettings::default(),
            metrics_addr: None,
        }
    }
}

/// Accepts `0x35` style hex as well as decimal.
pub fn parse_bus_address(value: &str) -> Option<u8> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) -> Result<()> {
    if let Ok(value) = env::var("PLUGBRIDGE_MODE") {
        config.mode = match value.trim().to_ascii_lowercase().as_str() {
            "bus" => ControlMode::Bus,
            "pins" => ControlMode::Pins,
            other => anyhow::bail!("PLUGBRIDGE_MODE must be bus or pins, got {other:?}"),
        };
    }

    if let Ok(value) = env::var("PLUGBRIDGE_LOG_LEVEL") {
        config.log_level = value;
    }

    if let Ok(value) = env::var("PLUGBRIDGE_AP_NAME") {
        config.ap_name = value;
    }

    if let Ok(value) = env::var("PLUGBRIDGE_PLUGS_FILE") {
        config.plugs_file = Some(value);
    }

    if let Some(octets) = parse_env_list::<u8>("PLUGBRIDGE_PLUG_IPS") {
        config.plugs.ip_octets = octets;
    }

    if let Some(counts) = parse_env_list::<u16>("PLUGBRIDGE_PLUGS_PER_IP") {
        config.plugs.plugs_per_ip = counts;
    }

    if let Some(pins) = parse_env_list::<u32>("PLUGBRIDGE_PINS") {
        config.plugs.pins = pins;
    }

    if let Ok(value) = env::var("PLUGBRIDGE_BASE_URL") {
        config.plugs.base_url_prefix = value;
    }

    if let Some(timeout_ms) = parse_env_u64("PLUGBRIDGE_TIMEOUT_MS") {
        config.transport.timeout_ms = timeout_ms;
    }

    config.transport.port = parse_env_u16("PLUGBRIDGE_PLUG_PORT").or(config.transport.port);

    if let Some(address) = env::var("PLUGBRIDGE_BUS_ADDRESS")
        .ok()
        .and_then(|value| parse_bus_address(&value))
    {
        config.bus.address = address;
    }

    if let Ok(value) = env::var("PLUGBRIDGE_TUNNEL_LISTEN") {
        config.bus.tunnel_listen = value;
    }

    config.bus.service_interval_ms =
        parse_env_u64("PLUGBRIDGE_SERVICE_INTERVAL_MS").unwrap_or(config.bus.service_interval_ms);

    if let Ok(value) = env::var("PLUGBRIDGE_GPIO_PATH") {
        config.pins.sysfs_base_path = value;
    }

    config.pins.poll_interval_ms =
        parse_env_u64("PLUGBRIDGE_PIN_POLL_MS").unwrap_or(config.pins.poll_interval_ms);

    config.metrics_addr = env::var("PLUGBRIDGE_METRICS_ADDR").ok().or(config.metrics_addr.take());
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    mode: Option<ControlMode>,
    log_level: Option<String>,
    ap_name: Option<String>,
    plugs: Option<FilePlugsConfig>,
    plugs_file: Option<String>,
    transport: Option<FileTransportConfig>,
    bus: Option<FileBusConfig>,
    pins: Option<FilePinsConfig>,
    metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilePlugsConfig {
    #[serde(alias = "esp_pin_map")]
    pins: Option<Vec<u32>>,
    #[serde(alias = "plug_ip")]
    ip_octets: Option<Vec<u8>>,
    plugs_per_ip: Option<Vec<u16>>,
    base_url_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileTransportConfig {
    timeout_ms: Option<u64>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct FileBusConfig {
    address: Option<u8>,
    tunnel_listen: Option<String>,
    service_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePinsConfig {
    sysfs_base_path: Option<String>,
    poll_interval_ms: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("PLUGBRIDGE_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

/// Reads the `{ "esp_pin_map", "plug_ip", "plugs_per_ip" }` document.
fn load_plug_document(path: &str) -> Result<PlugConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("read plugs file {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("parse plugs file {path}"))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(mode) = file.mode {
        config.mode = mode;
    }
    if let Some(level) = file.log_level {
        config.log_level = level;
    }
    if let Some(name) = file.ap_name {
        config.ap_name = name;
    }
    if let Some(path) = file.plugs_file {
        config.plugs_file = Some(path);
    }
    if let Some(addr) = file.metrics_addr {
        config.metrics_addr = Some(addr);
    }

    if let Some(plugs) = file.plugs {
        if let Some(pins) = plugs.pins {
            config.plugs.pins = pins;
        }
        if let Some(octets) = plugs.ip_octets {
            config.plugs.ip_octets = octets;
        }
        if let Some(counts) = plugs.plugs_per_ip {
            config.plugs.plugs_per_ip = counts;
        }
        if let Some(prefix) = plugs.base_url_prefix {
            config.plugs.base_url_prefix = prefix;
        }
    }

    if let Some(transport) = file.transport {
        if let Some(timeout_ms) = transport.timeout_ms {
            config.transport.timeout_ms = timeout_ms;
        }
        if let Some(port) = transport.port {
            config.transport.port = Some(port);
        }
    }

    if let Some(bus) = file.bus {
        if let Some(address) = bus.address {
            config.bus.address = address;
        }
        if let Some(listen) = bus.tunnel_listen {
            config.bus.tunnel_listen = listen;
        }
        if let Some(interval) = bus.service_interval_ms {
            config.bus.service_interval_ms = interval;
        }
    }

    if let Some(pins) = file.pins {
        if let Some(path) = pins.sysfs_base_path {
            config.pins.sysfs_base_path = path;
        }
        if let Some(interval) = pins.poll_interval_ms {
            config.pins.poll_interval_ms = interval;
        }
    }
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Comma-separated list; any unparsable entry rejects the whole variable.
fn parse_env_list<T: FromStr>(key: &str) -> Option<Vec<T>> {
    let value = env::var(key).ok()?;
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.parse().ok())
        .collect()
}
