//! Master side of the plug bus: sends command frames and polls for results.

pub mod link;

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use bus_peripheral::{Command, Opcode, PRIMARY_ADDRESS};
use types::{code, describe_code, EnergySample, ENERGY_PAYLOAD_LEN};

pub use link::{BusLink, LoopbackLink, TunnelLink};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("bus link failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no peripheral answered at {address:#04x}")]
    Nack { address: u8 },
    #[error("no result within {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    #[error("peripheral reported {code} ({})", describe_code(*.code))]
    Device { code: i8 },
    #[error("energy payload was {0} bytes")]
    ShortPayload(usize),
}

impl MasterError {
    /// The completion code a caller would have seen on the wire.
    pub fn code(&self) -> i8 {
        match self {
            MasterError::Io(_) | MasterError::Nack { .. } => code::BUS_TIMEOUT,
            MasterError::Timeout { .. } => code::MASTER_TIMEOUT,
            MasterError::Device { code } => *code,
            MasterError::ShortPayload(_) => code::UNHANDLED_CASE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub address: u8,
    pub response_timeout: Duration,
    pub poll_delay: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: PRIMARY_ADDRESS,
            response_timeout: Duration::from_secs(10),
            poll_delay: Duration::from_millis(100),
        }
    }
}

pub struct BusMaster<L> {
    link: L,
    config: MasterConfig,
}

impl<L: BusLink> BusMaster<L> {
    pub fn new(link: L, config: MasterConfig) -> Self {
        Self { link, config }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn into_link(self) -> L {
        self.link
    }

    pub async fn power_on(&mut self, group: u8, sub: u8) -> Result<(), MasterError> {
        self.expect_success(Command::new(Opcode::PowerOn, group, sub))
            .await
    }

    pub async fn power_off(&mut self, group: u8, sub: u8) -> Result<(), MasterError> {
        self.expect_success(Command::new(Opcode::PowerOff, group, sub))
            .await
    }

    /// Signal strength in percent as reported by the plug.
    pub async fn rssi(&mut self, group: u8, sub: u8) -> Result<i8, MasterError> {
        let code = self
            .execute(Command::new(Opcode::ReadRssi, group, sub))
            .await?;
        if code < 0 {
            return Err(MasterError::Device { code });
        }
        Ok(code)
    }

    pub async fn energy(&mut self, group: u8, sub: u8) -> Result<EnergySample, MasterError> {
        self.expect_success(Command::new(Opcode::ReadEnergy, group, sub))
            .await?;
        let payload = self
            .link
            .read(self.config.address, ENERGY_PAYLOAD_LEN as u8)
            .await?;
        EnergySample::from_bytes(&payload).ok_or(MasterError::ShortPayload(payload.len()))
    }

    async fn expect_success(&mut self, command: Command) -> Result<(), MasterError> {
        match self.execute(command).await? {
            code::SUCCESS => Ok(()),
            code => Err(MasterError::Device { code }),
        }
    }

    /// Writes `command` and returns the first completion code that is not
    /// busy. A missing answer counts as busy until the response timeout.
    pub async fn execute(&mut self, command: Command) -> Result<i8, MasterError> {
        let address = self.config.address;
        self.link.write(address, &command.to_bytes()).await?;
        debug!(opcode = command.opcode.label(), address = %command.address, "command sent");

        let started = Instant::now();
        let deadline = started + self.config.response_timeout;
        loop {
            match self.link.read(address, 1).await {
                Ok(reply) => match reply.first() {
                    Some(&byte) if byte as i8 != code::BUSY => {
                        let code = byte as i8;
                        debug!(
                            code,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "completion received"
                        );
                        return Ok(code);
                    }
                    _ => {}
                },
                Err(MasterError::Nack { .. }) => {}
                Err(err) => return Err(err),
            }

            if Instant::now() >= deadline {
                let waited_ms = self.config.response_timeout.as_millis() as u64;
                warn!(opcode = command.opcode.label(), waited_ms, "peripheral never completed");
                return Err(MasterError::Timeout { waited_ms });
            }
            sleep(self.config.poll_delay).await;
        }
    }
}
