use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_std::channel::{unbounded, Receiver, Sender};
use async_std::fs::{self, File};
use async_std::io::prelude::*;
use async_std::net::{ToSocketAddrs, UdpSocket};
use async_std::path::Path;
use async_std::sync::Mutex;
use async_std::task;
use pretty_bytes::converter::convert;
use tracing::{debug, info, warn};

use crate::tftp::error::{Result, TransferError};
use crate::tftp::shared::data_channel::{ChannelConfig, RxChannel, TxChannel};
use crate::tftp::shared::err_packet::{ErrorPacket, TFTPError};
use crate::tftp::shared::request_packet::{ReadRequestPacket, WriteRequestPacket};
use crate::tftp::shared::{parse_udp_packet, Endianness, TFTPPacket, STRIDE_SIZE};

const RECV_BUF_LEN: usize = 1024;
const MODE: &str = "octet";

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Byte order of every packet the client sends.
    pub order: Endianness,
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            order: Endianness::Big,
            channel: ChannelConfig::default(),
        }
    }
}

/// Socket tasks shuttling packets between the network and one transfer.
///
/// The server may answer from a different port than the one the request
/// went to (RFC 1350 transfer IDs), so the first reply fixes the peer.
struct Session {
    sender: task::JoinHandle<()>,
    receiver: task::JoinHandle<()>,
}

impl Session {
    /// Returns the session plus the inbound and outbound ends for the
    /// transfer.
    async fn open(
        server: SocketAddr,
        order: Endianness,
    ) -> io::Result<(Self, Receiver<TFTPPacket>, Sender<TFTPPacket>)> {
        let bind_addr = match server {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let sock = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("[CLIENT_ADDRESS]: {}", sock.local_addr()?);

        let peer = Arc::new(Mutex::new(None));
        let (to_transfer, inbound) = unbounded();
        let (outbound, from_transfer) = unbounded();

        let session = Session {
            sender: task::spawn(send_loop(
                sock.clone(),
                from_transfer,
                peer.clone(),
                server,
                order,
            )),
            receiver: task::spawn(recv_loop(sock, to_transfer, peer, order)),
        };
        Ok((session, inbound, outbound))
    }

    /// Flushes what the transfer queued, then stops listening. The
    /// transfer's channel ends must already be dropped.
    async fn close(self) {
        self.sender.await;
        self.receiver.cancel().await;
    }
}

async fn send_loop(
    sock: Arc<UdpSocket>,
    from_transfer: Receiver<TFTPPacket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    server: SocketAddr,
    order: Endianness,
) {
    while let Ok(packet) = from_transfer.recv().await {
        let dest = peer.lock().await.unwrap_or(server);
        debug!("{} -> {}", packet, dest);
        if let Err(e) = sock.send_to(&packet.serialize(order), dest).await {
            warn!("Failed to send to {}: {}", dest, e);
            break;
        }
    }
}

async fn recv_loop(
    sock: Arc<UdpSocket>,
    to_transfer: Sender<TFTPPacket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    order: Endianness,
) {
    let mut buf = [0; RECV_BUF_LEN];
    loop {
        let (count, addr) = match sock.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        };

        // Only a well-formed packet may claim the transfer ID.
        let packet = match parse_udp_packet(&buf[..count]) {
            Ok((packet, _)) => packet,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", addr, e);
                continue;
            }
        };

        {
            let mut peer = peer.lock().await;
            let current = *peer;
            match current {
                None => *peer = Some(addr),
                Some(known) if known != addr => {
                    debug!("Packet from stranger {}", addr);
                    let ep = TFTPPacket::ERR(ErrorPacket::new(TFTPError::UnknownTID));
                    let _ = sock.send_to(&ep.serialize(order), addr).await;
                    continue;
                }
                Some(_) => {}
            }
        }

        debug!("{} <- {}", packet, addr);
        if to_transfer.send(packet).await.is_err() {
            break;
        }
    }
}

/// Fetches `filename` from the server into `local`.
pub async fn download(
    server: SocketAddr,
    filename: &str,
    local: &Path,
    config: ClientConfig,
) -> Result<usize> {
    let (session, inbound, outbound) = Session::open(server, config.order).await?;
    let rrq = ReadRequestPacket::new(filename, MODE);
    let result = match RxChannel::request(inbound, outbound, config.channel, rrq).await {
        Ok(channel) => receive_file(channel, local).await,
        Err(e) => Err(e),
    };

    session.close().await;
    result
}

async fn receive_file(mut channel: RxChannel, local: &Path) -> Result<usize> {
    let mut buf = [0; STRIDE_SIZE];
    // The file is created after the first block, so a refused request
    // leaves nothing behind.
    let mut n = channel.read(&mut buf).await?;
    let mut fd = match File::create(local).await {
        Ok(fd) => fd,
        Err(e) => {
            channel.respond_error(TFTPError::AccessViolation, &e.to_string()).await;
            return Err(e.into());
        }
    };

    let result = loop {
        if n == 0 {
            break fd.flush().await.map_err(TransferError::from);
        }
        if let Err(e) = fd.write_all(&buf[..n]).await {
            channel.respond_error(TFTPError::DiskFull, &e.to_string()).await;
            break Err(e.into());
        }
        n = match channel.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => break Err(e),
        };
    };

    match result {
        Ok(()) => Ok(channel.transfer_size()),
        Err(e) => {
            drop(fd);
            if let Err(e) = fs::remove_file(local).await {
                warn!("Failed to remove partial file {}: {}", local.display(), e);
            }
            Err(e)
        }
    }
}

/// Sends `local` to the server, stored there as `filename`.
pub async fn upload(
    server: SocketAddr,
    filename: &str,
    local: &Path,
    config: ClientConfig,
) -> Result<usize> {
    let fd = File::open(local).await?;
    let (session, inbound, outbound) = Session::open(server, config.order).await?;
    let wrq = WriteRequestPacket::new(filename, MODE);
    let result = match TxChannel::request(inbound, outbound, config.channel, wrq).await {
        Ok(channel) => send_file(channel, fd).await,
        Err(e) => Err(e),
    };

    session.close().await;
    result
}

async fn send_file(mut channel: TxChannel, mut fd: File) -> Result<usize> {
    let mut buf = [0; STRIDE_SIZE];
    loop {
        let bytes_read = match fd.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                channel.respond_error(TFTPError::UndefinedError, &e.to_string()).await;
                return Err(e.into());
            }
        };

        if bytes_read == 0 {
            break;
        }
        channel.write(&buf[..bytes_read]).await?;
    }

    channel.finish().await?;
    Ok(channel.transfer_size())
}

/// Entry point for TFTP client.
pub async fn client_main<A: ToSocketAddrs>(
    server_address: A,
    filename: &str,
    upload_file: bool,
    config: ClientConfig,
) -> Result<usize> {
    let server = server_address
        .to_socket_addrs()
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no server address"))?;
    let local = Path::new(filename);

    let bytes = if upload_file {
        info!("Uploading...");
        upload(server, filename, local, config).await?
    } else {
        info!("Downloading...");
        download(server, filename, local, config).await?
    };

    info!("{} transferred successfully.", convert(bytes as f64));
    Ok(bytes)
}
