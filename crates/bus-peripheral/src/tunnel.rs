//! Bus transactions carried over TCP, for hosts without a peripheral-mode bus
//! controller.
//!
//! Write: `[address, 'W', len, data..]`, no reply.
//! Read:  `[address, 'R', len]`, reply `[n, data..]` with `n <= len`.
//!
//! Transactions for another address are dropped; reads for another address
//! get `n = 0`, which the master treats like a NACK.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::BusHandle;

pub const WRITE: u8 = b'W';
pub const READ: u8 = b'R';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Write { address: u8, data: Vec<u8> },
    Read { address: u8, len: u8 },
}

impl Transaction {
    pub fn address(&self) -> u8 {
        match self {
            Transaction::Write { address, .. } | Transaction::Read { address, .. } => *address,
        }
    }
}

/// Returns `Ok(None)` when the peer closed the stream between transactions.
pub async fn read_transaction<R>(reader: &mut R) -> io::Result<Option<Transaction>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    reader.read_exact(&mut header[1..]).await?;

    let [address, kind, len] = header;
    match kind {
        WRITE => {
            let mut data = vec![0u8; usize::from(len)];
            reader.read_exact(&mut data).await?;
            Ok(Some(Transaction::Write { address, data }))
        }
        READ => Ok(Some(Transaction::Read { address, len })),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown transaction kind {other:#04x}"),
        )),
    }
}

pub async fn write_transaction<W>(writer: &mut W, transaction: &Transaction) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(3);
    match transaction {
        Transaction::Write { address, data } => {
            let len = u8::try_from(data.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "write transaction over 255 bytes")
            })?;
            out.extend_from_slice(&[*address, WRITE, len]);
            out.extend_from_slice(data);
        }
        Transaction::Read { address, len } => {
            out.extend_from_slice(&[*address, READ, *len]);
        }
    }
    writer.write_all(&out).await?;
    writer.flush().await
}

pub async fn read_reply<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await?;
    let mut data = vec![0u8; usize::from(len)];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

pub async fn write_reply<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u8::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "reply over 255 bytes"))?;
    writer.write_u8(len).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Accepts tunnel connections until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    handle: BusHandle,
    address: u8,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(listen = %listener.local_addr()?, address = format_args!("{address:#04x}"), "bus tunnel listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!(peer = %peer, "bus master connected");
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, handle, address).await {
                        warn!(peer = %peer, error = %err, "bus tunnel connection failed");
                    } else {
                        info!(peer = %peer, "bus master disconnected");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("bus tunnel shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}

pub async fn serve_connection(
    mut stream: TcpStream,
    handle: BusHandle,
    address: u8,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    while let Some(transaction) = read_transaction(&mut stream).await? {
        let target = transaction.address();
        let ours = target == address;
        match transaction {
            Transaction::Write { data, .. } => {
                if ours {
                    handle.on_receive(&data);
                } else {
                    debug!(to = format_args!("{target:#04x}"), len = data.len(), "write for another address");
                }
            }
            Transaction::Read { len, .. } => {
                if ours && len == 0 {
                    // nothing to carry the reply, leave the slot alone
                    write_reply(&mut stream, &[]).await?;
                } else if ours {
                    let mut reply = handle.on_request().to_vec();
                    reply.truncate(usize::from(len));
                    write_reply(&mut stream, &reply).await?;
                } else {
                    write_reply(&mut stream, &[]).await?;
                }
            }
        }
    }
    Ok(())
}
