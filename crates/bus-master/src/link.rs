use async_trait::async_trait;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::info;

use bus_peripheral::tunnel::{self, Transaction};
use bus_peripheral::BusHandle;

use crate::MasterError;

/// One bus transaction at a time, addressed to a 7-bit peripheral address.
#[async_trait]
pub trait BusLink: Send {
    async fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), MasterError>;

    /// An empty answer is reported as [`MasterError::Nack`].
    async fn read(&mut self, address: u8, len: u8) -> Result<Vec<u8>, MasterError>;
}

/// Talks to a peripheral in the same process.
#[derive(Debug, Clone)]
pub struct LoopbackLink {
    handle: BusHandle,
    address: u8,
}

impl LoopbackLink {
    pub fn new(handle: BusHandle, address: u8) -> Self {
        Self { handle, address }
    }
}

#[async_trait]
impl BusLink for LoopbackLink {
    async fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), MasterError> {
        if address != self.address {
            return Err(MasterError::Nack { address });
        }
        self.handle.on_receive(bytes);
        Ok(())
    }

    async fn read(&mut self, address: u8, len: u8) -> Result<Vec<u8>, MasterError> {
        if address != self.address {
            return Err(MasterError::Nack { address });
        }
        let mut reply = self.handle.on_request().to_vec();
        reply.truncate(usize::from(len));
        Ok(reply)
    }
}

/// Talks to a bridge over the TCP bus tunnel.
#[derive(Debug)]
pub struct TunnelLink {
    stream: TcpStream,
}

impl TunnelLink {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, MasterError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(peer = %stream.peer_addr()?, "bus tunnel connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl BusLink for TunnelLink {
    async fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), MasterError> {
        let transaction = Transaction::Write {
            address,
            data: bytes.to_vec(),
        };
        tunnel::write_transaction(&mut self.stream, &transaction).await?;
        Ok(())
    }

    async fn read(&mut self, address: u8, len: u8) -> Result<Vec<u8>, MasterError> {
        tunnel::write_transaction(&mut self.stream, &Transaction::Read { address, len }).await?;
        let reply = tunnel::read_reply(&mut self.stream).await?;
        if reply.is_empty() {
            return Err(MasterError::Nack { address });
        }
        Ok(reply)
    }
}
