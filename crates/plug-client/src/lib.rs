use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use device_registry::{DeviceRegistry, PlugEndpoint, RegistryError};
use status_parser::{parse_energy, parse_power, parse_rssi, ParserError};
use types::{DeviceAddress, EnergySample, PowerState};

/// Options for talking to Tasmota plugs over HTTP.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for one request, connect through body, in milliseconds.
    pub timeout_ms: u64,
    /// Appended to the plug address when the plugs do not listen on port 80.
    pub port: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 4_000,
            port: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlugError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("plug answered with HTTP status {0}")]
    Status(u16),
    #[error("malformed plug reply: {0}")]
    Decode(#[from] ParserError),
}

impl PlugError {
    /// Decode failures will repeat on retry; transport failures may not.
    pub fn is_decode(&self) -> bool {
        matches!(self, PlugError::Decode(_))
    }
}

/// Where one plug lives: its base URL and, for multiplexed IPs, its relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugTarget {
    pub base_url: String,
    pub relay: Option<u16>,
}

impl PlugTarget {
    pub fn of(registry: &DeviceRegistry, endpoint: &PlugEndpoint) -> Self {
        Self {
            base_url: registry.ip_address_of(endpoint),
            relay: endpoint.relay,
        }
    }

    pub fn resolve(registry: &DeviceRegistry, address: DeviceAddress) -> Result<Self, RegistryError> {
        registry
            .resolve(address)
            .map(|endpoint| Self::of(registry, endpoint))
    }

    fn power_verb(&self) -> String {
        match self.relay {
            Some(n) => format!("Power{n}"),
            None => "Power".to_string(),
        }
    }
}

/// The four conversations the bridge has with a plug. No state is kept
/// between calls.
#[async_trait]
pub trait PlugTransport: Send + Sync {
    async fn query_power(&self, target: &PlugTarget) -> Result<PowerState, PlugError>;

    /// Success means the plug answered with an HTTP success status.
    async fn set_power(&self, target: &PlugTarget, on: bool) -> Result<(), PlugError>;

    async fn query_rssi(&self, target: &PlugTarget) -> Result<i32, PlugError>;

    async fn query_energy(&self, target: &PlugTarget) -> Result<EnergySample, PlugError>;
}

#[derive(Debug, Clone)]
pub struct HttpPlugTransport {
    config: ClientConfig,
    client: reqwest::Client,
}

impl HttpPlugTransport {
    pub fn new(config: ClientConfig) -> Result<Self, PlugError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn command_url(&self, target: &PlugTarget, verb: &str) -> String {
        match self.config.port {
            Some(port) => format!("{}:{port}/cm?cmnd={verb}", target.base_url),
            None => format!("{}/cm?cmnd={verb}", target.base_url),
        }
    }

    async fn get(&self, target: &PlugTarget, verb: &str) -> Result<String, PlugError> {
        let url = self.command_url(target, verb);
        let request = async {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(PlugError::Status(status.as_u16()));
            }
            Ok::<String, PlugError>(response.text().await?)
        };

        match timeout(Duration::from_millis(self.config.timeout_ms), request).await {
            Ok(Ok(body)) => {
                debug!(url = %url, bytes = body.len(), "plug request ok");
                Ok(body)
            }
            Ok(Err(err)) => {
                debug!(url = %url, error = %err, "plug request failed");
                Err(err)
            }
            Err(_) => {
                debug!(url = %url, timeout_ms = self.config.timeout_ms, "plug request timeout");
                Err(PlugError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }
}

#[async_trait]
impl PlugTransport for HttpPlugTransport {
    async fn query_power(&self, target: &PlugTarget) -> Result<PowerState, PlugError> {
        let body = self.get(target, &target.power_verb()).await?;
        Ok(parse_power(&body, target.relay)?)
    }

    async fn set_power(&self, target: &PlugTarget, on: bool) -> Result<(), PlugError> {
        let verb = format!(
            "{}%20{}",
            target.power_verb(),
            if on { "On" } else { "Off" }
        );
        self.get(target, &verb).await.map(|_| ())
    }

    async fn query_rssi(&self, target: &PlugTarget) -> Result<i32, PlugError> {
        let body = self.get(target, "Status%2011").await?;
        Ok(parse_rssi(&body)?)
    }

    async fn query_energy(&self, target: &PlugTarget) -> Result<EnergySample, PlugError> {
        let body = self.get(target, "Status%2010").await?;
        Ok(parse_energy(&body)?)
    }
}
