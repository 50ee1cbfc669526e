use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_std::channel::{unbounded, Receiver, Sender};
use async_std::fs::{self, File, OpenOptions};
use async_std::io::prelude::*;
use async_std::net::{ToSocketAddrs, UdpSocket};
use async_std::path::{Path, PathBuf};
use async_std::sync::Mutex;
use async_std::task;
use pretty_bytes::converter::convert;
use tracing::{debug, info, warn};

use crate::tftp::error::{Result, TransferError};
use crate::tftp::shared::data_channel::{ChannelConfig, RxChannel, TxChannel};
use crate::tftp::shared::err_packet::{ErrorPacket, TFTPError};
use crate::tftp::shared::request_packet::{ReadRequestPacket, Request, WriteRequestPacket};
use crate::tftp::shared::{parse_udp_packet, Endianness, TFTPPacket, STRIDE_SIZE};

/// Largest datagram a peer can legally send, with room to spot oversized ones.
const RECV_BUF_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory every filename is resolved against.
    pub root: PathBuf,
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            root: PathBuf::from("."),
            channel: ChannelConfig::default(),
        }
    }
}

/// Inbound side of every live transfer, keyed by the peer's address.
type Routes = Arc<Mutex<HashMap<SocketAddr, Sender<TFTPPacket>>>>;

/// A TFTP server that serves any number of concurrent clients from a
/// single socket.
pub struct TFTPServer {
    socket: Arc<UdpSocket>,
    config: Arc<ServerConfig>,
    transfers: Routes,
}

impl TFTPServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(TFTPServer {
            socket: Arc::new(socket),
            config: Arc::new(config),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams forever, handing each one to its transfer.
    pub async fn run(&self) -> io::Result<()> {
        info!(
            "[SERVER_ADDRESS]: {} serving {}",
            self.local_addr()?,
            self.config.root.display()
        );

        let mut buf = [0; RECV_BUF_LEN];
        loop {
            let (count, addr) = self.socket.recv_from(&mut buf).await?;
            self.dispatch(&buf[..count], addr).await;
        }
    }

    async fn dispatch(&self, raw: &[u8], addr: SocketAddr) {
        let (packet, order) = match parse_udp_packet(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", addr, e);
                return;
            }
        };
        debug!("{} <- {} ({})", packet, addr, order);

        let mut transfers = self.transfers.lock().await;
        if let Some(inbound) = transfers.get(&addr).cloned() {
            match packet {
                // The peer is repeating its request; the transfer's own
                // retransmission answers it.
                TFTPPacket::RRQ(_) | TFTPPacket::WRQ(_) => debug!("Repeated request from {}", addr),
                packet => {
                    if inbound.try_send(packet).is_err() {
                        transfers.remove(&addr);
                    }
                }
            }
            return;
        }

        match packet {
            TFTPPacket::RRQ(rrq) => self.start(&mut transfers, addr, order, Incoming::Read(rrq)),
            TFTPPacket::WRQ(wrq) => self.start(&mut transfers, addr, order, Incoming::Write(wrq)),
            other => {
                drop(transfers);
                debug!("{} from unknown peer {}", other, addr);
                let ep = TFTPPacket::ERR(ErrorPacket::new(TFTPError::UnknownTID));
                if let Err(e) = self.socket.send_to(&ep.serialize(order), addr).await {
                    warn!("Failed to answer {}: {}", addr, e);
                }
            }
        }
    }

    /// Wires up a new transfer and runs it on its own task.
    fn start(
        &self,
        transfers: &mut HashMap<SocketAddr, Sender<TFTPPacket>>,
        addr: SocketAddr,
        order: Endianness,
        request: Incoming,
    ) {
        let (to_transfer, inbound) = unbounded();
        let (outbound, from_transfer) = unbounded();
        let route = to_transfer.clone();
        transfers.insert(addr, to_transfer);

        task::spawn(pump(self.socket.clone(), from_transfer, addr, order));

        let config = self.config.clone();
        let routes = self.transfers.clone();
        task::spawn(async move {
            let result = match request {
                Incoming::Read(rrq) => {
                    info!("[UPLOAD] FILE: ({}) TO CLIENT: {}", rrq.filename(), addr);
                    serve_read(rrq, inbound, outbound, &config).await
                }
                Incoming::Write(wrq) => {
                    info!("[DOWNLOAD] FILE: ({}) FROM CLIENT: {}", wrq.filename(), addr);
                    serve_write(wrq, inbound, outbound, &config).await
                }
            };

            match result {
                Ok(bytes) => {
                    info!("{} transferred successfully with {}.", convert(bytes as f64), addr)
                }
                Err(e) => warn!("Transfer with {} failed: {}", addr, e),
            }
            release(&mut *routes.lock().await, addr, &route);
        });
    }
}

/// Forgets the route of `addr` unless it already belongs to a newer transfer.
fn release(
    transfers: &mut HashMap<SocketAddr, Sender<TFTPPacket>>,
    addr: SocketAddr,
    route: &Sender<TFTPPacket>,
) {
    if transfers.get(&addr).map_or(false, |current| current.same_channel(route)) {
        transfers.remove(&addr);
    }
}

enum Incoming {
    Read(ReadRequestPacket),
    Write(WriteRequestPacket),
}

/// Encodes everything a transfer emits and sends it to its peer.
async fn pump(
    socket: Arc<UdpSocket>,
    outbound: Receiver<TFTPPacket>,
    peer: SocketAddr,
    order: Endianness,
) {
    while let Ok(packet) = outbound.recv().await {
        debug!("{} -> {}", packet, peer);
        if let Err(e) = socket.send_to(&packet.serialize(order), peer).await {
            warn!("Failed to send to {}: {}", peer, e);
            break;
        }
    }
}

/// Sends the contents of the requested file.
async fn serve_read(
    rrq: ReadRequestPacket,
    inbound: Receiver<TFTPPacket>,
    outbound: Sender<TFTPPacket>,
    config: &ServerConfig,
) -> Result<usize> {
    let path = match check_request(&rrq, config) {
        Ok(path) => path,
        Err(ep) => return reject(&outbound, ep).await,
    };

    let mut fd = match File::open(&path).await {
        Ok(fd) => fd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return reject(&outbound, ErrorPacket::new(TFTPError::FileNotFound)).await
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return reject(&outbound, ErrorPacket::new(TFTPError::AccessViolation)).await
        }
        Err(e) => return reject(&outbound, ErrorPacket::new_custom(e.to_string())).await,
    };

    let mut channel = TxChannel::new(inbound, outbound, config.channel);
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

/// Stores the uploaded file, removing it again if the transfer fails.
/// A finished upload lingers for one timeout to repeat its last ACK.
async fn serve_write(
    wrq: WriteRequestPacket,
    inbound: Receiver<TFTPPacket>,
    outbound: Sender<TFTPPacket>,
    config: &ServerConfig,
) -> Result<usize> {
    let path = match check_request(&wrq, config) {
        Ok(path) => path,
        Err(ep) => return reject(&outbound, ep).await,
    };

    let mut fd = match create_upload(&path).await {
        Ok(fd) => fd,
        Err(ep) => return reject(&outbound, ep).await,
    };

    let mut channel = match RxChannel::accept(inbound, outbound, config.channel).await {
        Ok(channel) => channel,
        Err(e) => {
            discard(fd, &path).await;
            return Err(e);
        }
    };

    let mut buf = [0; STRIDE_SIZE];
    let result = loop {
        let n = match channel.read(&mut buf).await {
            Ok(0) => break fd.flush().await.map_err(TransferError::from),
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        if let Err(e) = fd.write_all(&buf[..n]).await {
            channel.respond_error(TFTPError::DiskFull, &e.to_string()).await;
            break Err(e.into());
        }
    };

    match result {
        Ok(()) => {
            channel.dally().await;
            Ok(channel.transfer_size())
        }
        Err(e) => {
            discard(fd, &path).await;
            Err(e)
        }
    }
}

/// Creates `path` for an upload, refusing to touch a file that exists.
async fn create_upload(path: &Path) -> std::result::Result<File, ErrorPacket> {
    match OpenOptions::new().write(true).create_new(true).open(path).await {
        Ok(fd) => Ok(fd),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(ErrorPacket::new(TFTPError::FileExists))
        }
        Err(e) => Err(ErrorPacket::with_message(TFTPError::AccessViolation, &e.to_string())),
    }
}

async fn discard(fd: File, path: &Path) {
    drop(fd);
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove partial file {}: {}", path.display(), e);
    }
}

/// Validates the mode and maps the filename under the server root.
fn check_request<R: Request>(
    req: &R,
    config: &ServerConfig,
) -> std::result::Result<PathBuf, ErrorPacket> {
    match req.transfer_mode() {
        Some(mode) if mode.is_supported() => {}
        _ => {
            let msg = format!("Unsupported transfer mode [{}]", req.mode());
            return Err(ErrorPacket::with_message(TFTPError::IllegalOperation, &msg));
        }
    }

    let file_name = req.filename();
    let path = std::path::Path::new(file_name);
    let confined = !file_name.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));

    if !confined {
        return Err(ErrorPacket::new(TFTPError::AccessViolation));
    }

    Ok(config.root.join(file_name))
}

/// Answers a request that never became a transfer.
async fn reject(outbound: &Sender<TFTPPacket>, ep: ErrorPacket) -> Result<usize> {
    debug!("DO_ERR [{}]: {}", ep.code(), ep.err());
    let err = TransferError::Rejected {
        code: ep.code(),
        message: ep.err().to_string(),
    };
    // Nobody left to tell when the pump is gone.
    let _ = outbound.send(TFTPPacket::ERR(ep)).await;
    Err(err)
}
