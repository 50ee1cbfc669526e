//! Stop-and-wait transfer engine.
//!
//! A transfer talks to the outside world through two packet channels
//! supplied by whoever owns the socket: `inbound` carries packets the
//! peer sent, `outbound` carries packets for the peer. [`TxChannel`]
//! turns writes into DATA blocks and waits for each ACK, [`RxChannel`]
//! turns incoming DATA blocks into reads and acknowledges them.

use std::time::{Duration, Instant};

use async_std::channel::{Receiver, Sender};
use async_std::future::timeout;
use tracing::{debug, warn};

use crate::tftp::error::{Result, TransferError};
use crate::tftp::shared::ack_packet::AckPacket;
use crate::tftp::shared::data_packet::DataPacket;
use crate::tftp::shared::err_packet::{ErrorPacket, TFTPError};
use crate::tftp::shared::request_packet::{ReadRequestPacket, WriteRequestPacket};
use crate::tftp::shared::{TFTPPacket, STRIDE_SIZE};

/// Time to wait for the peer before re-sending the last packet.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Re-sends allowed before a transfer is declared dead.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelConfig {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum DataChannelState {
    WaitData,
    SendData,
    WaitAck,
    WaitLastAck,
    Error,
    Done,
}

/// Retransmission budget of one wait.
struct Wait {
    deadline: Instant,
    resent: u32,
}

impl Wait {
    fn new(config: &ChannelConfig) -> Self {
        Wait {
            deadline: Instant::now() + config.timeout,
            resent: 0,
        }
    }
}

/// The channel pair of one transfer plus the packet to repeat on timeout.
struct PacketLink {
    inbound: Receiver<TFTPPacket>,
    outbound: Sender<TFTPPacket>,
    config: ChannelConfig,
    last_sent: Option<TFTPPacket>,
}

impl PacketLink {
    fn new(
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
        config: ChannelConfig,
    ) -> Self {
        PacketLink {
            inbound,
            outbound,
            config,
            last_sent: None,
        }
    }

    /// Sends `packet` and remembers it for retransmission.
    async fn send(&mut self, packet: TFTPPacket) -> Result<()> {
        self.push(packet.clone()).await?;
        self.last_sent = Some(packet);
        Ok(())
    }

    /// Sends `packet` without making it the retransmission candidate.
    async fn push(&mut self, packet: TFTPPacket) -> Result<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| TransferError::ChannelClosed)
    }

    async fn resend(&mut self) -> Result<()> {
        match self.last_sent.clone() {
            Some(packet) => {
                debug!("RESEND {}", packet);
                self.push(packet).await
            }
            None => Ok(()),
        }
    }

    /// Next inbound packet. Each time the wait's deadline passes the last
    /// sent packet goes out again, until the retry budget is spent.
    async fn recv(&mut self, wait: &mut Wait, blk: u16) -> Result<TFTPPacket> {
        loop {
            let remaining = wait.deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.inbound.recv()).await {
                Ok(Ok(packet)) => return Ok(packet),
                Ok(Err(_)) => return Err(TransferError::ChannelClosed),
                Err(_) if wait.resent < self.config.max_retries => {
                    wait.resent += 1;
                    wait.deadline = Instant::now() + self.config.timeout;
                    self.resend().await?;
                }
                Err(_) => {
                    return Err(TransferError::ProtocolTimeout {
                        blk,
                        attempts: wait.resent + 1,
                    })
                }
            }
        }
    }

    /// Reports `err` to the peer when it is a protocol failure, then stops
    /// all channel activity.
    async fn fail(&mut self, err: TransferError) -> TransferError {
        let reply = match &err {
            TransferError::IllegalOperation { .. } => {
                Some(ErrorPacket::new(TFTPError::IllegalOperation))
            }
            TransferError::ProtocolTimeout { .. } => {
                Some(ErrorPacket::new_custom(String::from("Transfer timed out")))
            }
            _ => None,
        };

        warn!("Transfer failed: {}", err);
        match reply {
            Some(ep) => self.terminate(ep).await,
            None => self.close(),
        }

        err
    }

    async fn terminate(&mut self, ep: ErrorPacket) {
        debug!("DO_ERR [{}]: {}", ep.code(), ep.err());
        // A closed outbound channel leaves nobody to tell.
        let _ = self.push(TFTPPacket::ERR(ep)).await;
        self.close();
    }

    fn close(&mut self) {
        self.inbound.close();
        self.outbound.close();
    }
}

/// Sending side of a transfer: serves a read request on the server, or
/// an upload on the client.
pub struct TxChannel {
    link: PacketLink,
    blk: u16,
    buf: Vec<u8>,
    bytes: usize,
    state: DataChannelState,
}

impl TxChannel {
    /// A channel answering a read request; the first write produces DATA #1.
    pub fn new(
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
        config: ChannelConfig,
    ) -> Self {
        TxChannel {
            link: PacketLink::new(inbound, outbound, config),
            blk: 0,
            buf: Vec::with_capacity(STRIDE_SIZE),
            bytes: 0,
            state: DataChannelState::SendData,
        }
    }

    /// Sends `wrq` and waits for the server's ACK #0.
    pub async fn request(
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
        config: ChannelConfig,
        wrq: WriteRequestPacket,
    ) -> Result<Self> {
        let mut channel = TxChannel::new(inbound, outbound, config);
        channel.set_state(DataChannelState::WaitAck);
        if let Err(e) = channel.link.send(TFTPPacket::WRQ(wrq)).await {
            return Err(channel.abort(e).await);
        }

        channel.await_ack().await?;
        channel.set_state(DataChannelState::SendData);
        Ok(channel)
    }

    /// Queues `data` for the peer. Every full block is sent and
    /// acknowledged before this returns; a partial block stays buffered
    /// until more data arrives or [`TxChannel::finish`] is called.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        self.buf.extend_from_slice(data);

        while self.buf.len() >= STRIDE_SIZE {
            let block: Vec<u8> = self.buf.drain(..STRIDE_SIZE).collect();
            self.send_block(block).await?;
        }

        Ok(data.len())
    }

    /// Sends whatever is buffered as the final, short block. When the data
    /// was a multiple of the block size that block is empty.
    pub async fn finish(&mut self) -> Result<()> {
        if self.state == DataChannelState::Done {
            return Ok(());
        }
        self.check_open()?;

        let block = std::mem::take(&mut self.buf);
        self.send_block(block).await
    }

    /// Tells the peer why the transfer stops and ends it.
    pub async fn respond_error(&mut self, err: TFTPError, msg: &str) {
        if self.state == DataChannelState::Error {
            return;
        }

        self.set_state(DataChannelState::Error);
        self.link.terminate(ErrorPacket::with_message(err, msg)).await;
    }

    async fn send_block(&mut self, block: Vec<u8>) -> Result<()> {
        self.blk = self.blk.wrapping_add(1);
        let len = block.len();
        let last = len < STRIDE_SIZE;
        debug!("DO_DATA #{} ({} bytes)", self.blk, len);

        self.set_state(if last {
            DataChannelState::WaitLastAck
        } else {
            DataChannelState::WaitAck
        });

        if let Err(e) = self.link.send(TFTPPacket::DATA(DataPacket::new(self.blk, block))).await {
            return Err(self.abort(e).await);
        }

        self.await_ack().await?;
        self.bytes += len;

        self.set_state(if last {
            DataChannelState::Done
        } else {
            DataChannelState::SendData
        });
        Ok(())
    }

    /// Blocks until the ACK for the current block. Stale ACKs and any
    /// other packet are dropped.
    async fn await_ack(&mut self) -> Result<()> {
        let mut wait = Wait::new(&self.link.config);
        loop {
            let packet = match self.link.recv(&mut wait, self.blk).await {
                Ok(packet) => packet,
                Err(e) => return Err(self.abort(e).await),
            };

            match packet {
                TFTPPacket::ACK(ap) if ap.blk() == self.blk => {
                    debug!("ON_ACK #{}", ap.blk());
                    return Ok(());
                }
                TFTPPacket::ERR(ep) => {
                    let err = TransferError::Peer {
                        code: ep.code(),
                        message: ep.err().to_string(),
                    };
                    return Err(self.abort(err).await);
                }
                other => debug!("Ignoring {} while waiting for ACK #{}", other, self.blk),
            }
        }
    }

    async fn abort(&mut self, err: TransferError) -> TransferError {
        self.set_state(DataChannelState::Error);
        self.link.fail(err).await
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            DataChannelState::Error | DataChannelState::Done => Err(TransferError::Terminated),
            _ => Ok(()),
        }
    }

    fn set_state(&mut self, state: DataChannelState) {
        debug!("Moving to {:?}", state);
        self.state = state;
    }

    /// Bytes the peer has acknowledged.
    pub fn transfer_size(&self) -> usize {
        self.bytes
    }

    pub fn is_done(&self) -> bool {
        self.state == DataChannelState::Done
    }

    pub fn is_err(&self) -> bool {
        self.state == DataChannelState::Error
    }

    pub fn blk(&self) -> u16 {
        self.blk
    }
}

/// Receiving side of a transfer: serves a write request on the server,
/// or a download on the client.
pub struct RxChannel {
    link: PacketLink,
    blk: u16,
    pending: Vec<u8>,
    bytes: usize,
    state: DataChannelState,
}

impl RxChannel {
    fn new(
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
        config: ChannelConfig,
    ) -> Self {
        RxChannel {
            link: PacketLink::new(inbound, outbound, config),
            blk: 0,
            pending: Vec::new(),
            bytes: 0,
            state: DataChannelState::WaitData,
        }
    }

    /// Accepts a write request by sending ACK #0.
    pub async fn accept(
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
        config: ChannelConfig,
    ) -> Result<Self> {
        RxChannel::new(inbound, outbound, config)
            .open(TFTPPacket::ACK(AckPacket::new(0)))
            .await
    }

    /// Sends `rrq`; DATA #1 is the server's answer.
    pub async fn request(
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
        config: ChannelConfig,
        rrq: ReadRequestPacket,
    ) -> Result<Self> {
        RxChannel::new(inbound, outbound, config)
            .open(TFTPPacket::RRQ(rrq))
            .await
    }

    async fn open(mut self, opening: TFTPPacket) -> Result<Self> {
        if let Err(e) = self.link.send(opening).await {
            return Err(self.abort(e).await);
        }
        Ok(self)
    }

    /// Fills `buf` from received blocks. Waits for the peer only when
    /// nothing is buffered; returns 0 once the final block is consumed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state == DataChannelState::Error {
            return Err(TransferError::Terminated);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() && self.state != DataChannelState::Done {
            self.receive_block().await?;
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    /// Reads until the final block, appending to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = [0; STRIDE_SIZE];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Tells the peer why the transfer stops and ends it.
    pub async fn respond_error(&mut self, err: TFTPError, msg: &str) {
        if self.state == DataChannelState::Error {
            return;
        }

        self.set_state(DataChannelState::Error);
        self.link.terminate(ErrorPacket::with_message(err, msg)).await;
    }

    /// Lingers for one timeout after the final block, acknowledging it
    /// again if the peer repeats it, then closes the channel.
    pub async fn dally(&mut self) {
        if self.state != DataChannelState::Done {
            return;
        }

        let deadline = Instant::now() + self.link.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.link.inbound.recv()).await {
                Ok(Ok(TFTPPacket::DATA(dp))) if dp.blk() == self.blk => {
                    debug!("Final DATA #{} repeated", dp.blk());
                    if self.link.resend().await.is_err() {
                        break;
                    }
                }
                Ok(Ok(other)) => debug!("Ignoring {} after the final block", other),
                _ => break,
            }
        }

        self.link.close();
    }

    /// Waits for the next in-sequence DATA block and acknowledges it.
    async fn receive_block(&mut self) -> Result<()> {
        let expected = self.blk.wrapping_add(1);
        let mut wait = Wait::new(&self.link.config);
        loop {
            let packet = match self.link.recv(&mut wait, expected).await {
                Ok(packet) => packet,
                Err(e) => return Err(self.abort(e).await),
            };

            match packet {
                TFTPPacket::DATA(dp) if dp.blk() == expected => {
                    debug!("ON_DATA #{} ({} bytes)", dp.blk(), dp.len());
                    let last = dp.is_last();
                    self.blk = expected;
                    self.bytes += dp.len();
                    self.pending.extend_from_slice(dp.payload());

                    debug!("DO_ACK #{}", self.blk);
                    let ap = TFTPPacket::ACK(AckPacket::new(self.blk));
                    if let Err(e) = self.link.send(ap).await {
                        return Err(self.abort(e).await);
                    }

                    self.set_state(if last {
                        DataChannelState::Done
                    } else {
                        DataChannelState::WaitData
                    });
                    return Ok(());
                }
                TFTPPacket::DATA(dp) => {
                    // The peer missed our ACK; repeat it, keep the payload we have.
                    debug!("Duplicate DATA #{}, expected #{}", dp.blk(), expected);
                    let ap = TFTPPacket::ACK(AckPacket::new(self.blk));
                    if let Err(e) = self.link.push(ap).await {
                        return Err(self.abort(e).await);
                    }
                }
                TFTPPacket::ERR(ep) => {
                    let err = TransferError::Peer {
                        code: ep.code(),
                        message: ep.err().to_string(),
                    };
                    return Err(self.abort(err).await);
                }
                other => {
                    let err = TransferError::IllegalOperation { opcode: other.op() };
                    return Err(self.abort(err).await);
                }
            }
        }
    }

    async fn abort(&mut self, err: TransferError) -> TransferError {
        self.set_state(DataChannelState::Error);
        self.link.fail(err).await
    }

    fn set_state(&mut self, state: DataChannelState) {
        debug!("Moving to {:?}", state);
        self.state = state;
    }

    /// Bytes received from the peer, consumed or not.
    pub fn transfer_size(&self) -> usize {
        self.bytes
    }

    pub fn is_done(&self) -> bool {
        self.state == DataChannelState::Done
    }

    pub fn is_err(&self) -> bool {
        self.state == DataChannelState::Error
    }

    pub fn blk(&self) -> u16 {
        self.blk
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_std::channel::{unbounded, Receiver, Sender};
    use async_std::future::timeout;
    use async_std::task;

    use crate::tftp::error::TransferError;
    use crate::tftp::shared::ack_packet::AckPacket;
    use crate::tftp::shared::data_channel::{ChannelConfig, RxChannel, TxChannel};
    use crate::tftp::shared::data_packet::DataPacket;
    use crate::tftp::shared::err_packet::{ErrorPacket, TFTPError};
    use crate::tftp::shared::request_packet::{ReadRequestPacket, WriteRequestPacket};
    use crate::tftp::shared::{TFTPPacket, STRIDE_SIZE};

    const PATIENT: ChannelConfig = ChannelConfig {
        timeout: Duration::from_secs(10),
        max_retries: 1,
    };
    const HASTY: ChannelConfig = ChannelConfig {
        timeout: Duration::from_millis(30),
        max_retries: 2,
    };
    const QUIET: Duration = Duration::from_millis(100);

    /// Peer ends of a fresh channel pair, plus the transfer's ends.
    struct Wire {
        to_channel: Sender<TFTPPacket>,
        from_channel: Receiver<TFTPPacket>,
        inbound: Receiver<TFTPPacket>,
        outbound: Sender<TFTPPacket>,
    }

    fn wire() -> Wire {
        let (to_channel, inbound) = unbounded();
        let (outbound, from_channel) = unbounded();
        Wire {
            to_channel,
            from_channel,
            inbound,
            outbound,
        }
    }

    fn data(blk: u16, len: usize, fill: u8) -> TFTPPacket {
        TFTPPacket::DATA(DataPacket::new(blk, vec![fill; len]))
    }

    fn ack(blk: u16) -> TFTPPacket {
        TFTPPacket::ACK(AckPacket::new(blk))
    }

    async fn expect_data(rx: &Receiver<TFTPPacket>, blk: u16, len: usize) {
        match rx.recv().await.unwrap() {
            TFTPPacket::DATA(dp) => {
                assert_eq!(dp.blk(), blk);
                assert_eq!(dp.len(), len);
            }
            other => panic!("Expected DATA #{}, got {}", blk, other),
        }
    }

    async fn expect_silence(rx: &Receiver<TFTPPacket>) {
        assert!(timeout(QUIET, rx.recv()).await.is_err(), "channel sent too early");
    }

    /// Everything the channel sent until it closed its outbound side.
    async fn drain(rx: &Receiver<TFTPPacket>) -> Vec<TFTPPacket> {
        let mut packets = Vec::new();
        while let Ok(p) = rx.recv().await {
            packets.push(p);
        }
        packets
    }

    #[async_std::test]
    async fn tx_sends_1024_bytes_in_three_blocks() {
        let w = wire();
        let mut ch = TxChannel::new(w.inbound, w.outbound, PATIENT);

        let handle = task::spawn(async move {
            assert_eq!(ch.write(&[7u8; 1024]).await.unwrap(), 1024);
            ch.finish().await.unwrap();
            ch
        });

        expect_data(&w.from_channel, 1, STRIDE_SIZE).await;
        w.to_channel.send(ack(1)).await.unwrap();
        expect_data(&w.from_channel, 2, STRIDE_SIZE).await;
        w.to_channel.send(ack(2)).await.unwrap();
        expect_data(&w.from_channel, 3, 0).await;
        w.to_channel.send(ack(3)).await.unwrap();

        let ch = handle.await;
        assert!(ch.is_done());
        assert_eq!(ch.transfer_size(), 1024);
        assert_eq!(ch.blk(), 3);
    }

    #[async_std::test]
    async fn tx_waits_for_matching_ack() {
        let w = wire();
        let mut ch = TxChannel::new(w.inbound, w.outbound, PATIENT);

        let handle = task::spawn(async move {
            ch.write(&[1u8; 600]).await.unwrap();
            ch.finish().await.unwrap();
            ch
        });

        expect_data(&w.from_channel, 1, STRIDE_SIZE).await;
        expect_silence(&w.from_channel).await;

        // Stale ACK and a stray DATA change nothing.
        w.to_channel.send(ack(0)).await.unwrap();
        w.to_channel.send(data(9, 3, 0)).await.unwrap();
        expect_silence(&w.from_channel).await;

        w.to_channel.send(ack(1)).await.unwrap();
        expect_data(&w.from_channel, 2, 88).await;
        w.to_channel.send(ack(1)).await.unwrap();
        expect_silence(&w.from_channel).await;
        w.to_channel.send(ack(2)).await.unwrap();

        let ch = handle.await;
        assert!(ch.is_done());
        assert_eq!(ch.transfer_size(), 600);
    }

    #[async_std::test]
    async fn tx_block_numbers_wrap() {
        let w = wire();
        let mut ch = TxChannel::new(w.inbound, w.outbound, PATIENT);
        ch.blk = 65534;

        let handle = task::spawn(async move {
            ch.write(&[0u8; 2 * STRIDE_SIZE]).await.unwrap();
            ch.finish().await.unwrap();
            ch
        });

        expect_data(&w.from_channel, 65535, STRIDE_SIZE).await;
        w.to_channel.send(ack(65535)).await.unwrap();
        expect_data(&w.from_channel, 0, STRIDE_SIZE).await;
        w.to_channel.send(ack(0)).await.unwrap();
        expect_data(&w.from_channel, 1, 0).await;
        w.to_channel.send(ack(1)).await.unwrap();

        assert!(handle.await.is_done());
    }

    #[async_std::test]
    async fn tx_retransmits_then_times_out() {
        let w = wire();
        let mut ch = TxChannel::new(w.inbound, w.outbound, HASTY);

        assert_eq!(ch.write(b"short").await.unwrap(), 5);
        match ch.finish().await {
            Err(TransferError::ProtocolTimeout { blk: 1, attempts: 3 }) => {}
            other => panic!("Unexpected result {:?}", other),
        }
        assert!(ch.is_err());

        let sent = drain(&w.from_channel).await;
        assert_eq!(sent.len(), 4);
        let block = TFTPPacket::DATA(DataPacket::new(1, b"short".to_vec()));
        assert!(sent[..3].iter().all(|p| *p == block));
        match &sent[3] {
            TFTPPacket::ERR(ep) => {
                assert_eq!(ep.code(), 0);
                assert_eq!(ep.err(), "Transfer timed out");
            }
            other => panic!("Expected ERR, got {}", other),
        }

        assert!(matches!(ch.write(b"more").await, Err(TransferError::Terminated)));
    }

    #[async_std::test]
    async fn tx_peer_error_ends_transfer() {
        let w = wire();
        let mut ch = TxChannel::new(w.inbound, w.outbound, PATIENT);
        w.to_channel
            .send(TFTPPacket::ERR(ErrorPacket::new(TFTPError::DiskFull))).await.unwrap();

        match ch.write(&[0u8; STRIDE_SIZE]).await {
            Err(TransferError::Peer { code: 3, .. }) => {}
            other => panic!("Unexpected result {:?}", other),
        }

        // Only the DATA block went out; errors are never answered.
        let sent = drain(&w.from_channel).await;
        assert_eq!(sent, vec![data(1, STRIDE_SIZE, 0)]);
    }

    #[async_std::test]
    async fn tx_respond_error_is_terminal() {
        let w = wire();
        let mut ch = TxChannel::new(w.inbound, w.outbound, PATIENT);

        ch.respond_error(TFTPError::FileNotFound, "File not found.").await;
        ch.respond_error(TFTPError::DiskFull, "ignored").await;

        assert_eq!(
            drain(&w.from_channel).await,
            vec![TFTPPacket::ERR(ErrorPacket::new(TFTPError::FileNotFound))]
        );
        assert!(matches!(ch.write(b"x").await, Err(TransferError::Terminated)));
        assert!(matches!(ch.finish().await, Err(TransferError::Terminated)));
    }

    #[async_std::test]
    async fn tx_request_waits_for_ack_zero() {
        let w = wire();
        let (inbound, outbound) = (w.inbound, w.outbound);
        let handle = task::spawn(async move {
            let wrq = WriteRequestPacket::new("up.bin", "octet");
            TxChannel::request(inbound, outbound, PATIENT, wrq).await
        });

        assert_eq!(
            w.from_channel.recv().await.unwrap(),
            TFTPPacket::WRQ(WriteRequestPacket::new("up.bin", "octet"))
        );
        w.to_channel.send(ack(0)).await.unwrap();

        let ch = handle.await.unwrap();
        assert_eq!(ch.blk(), 0);
        assert!(!ch.is_done());
    }

    #[async_std::test]
    async fn rx_acknowledges_each_block() {
        let w = wire();
        let (inbound, outbound) = (w.inbound, w.outbound);
        let handle = task::spawn(async move {
            let mut ch = RxChannel::accept(inbound, outbound, PATIENT).await.unwrap();
            let mut out = Vec::new();
            ch.read_to_end(&mut out).await.unwrap();
            (ch, out)
        });

        assert_eq!(w.from_channel.recv().await.unwrap(), ack(0));
        w.to_channel.send(data(1, STRIDE_SIZE, 1)).await.unwrap();
        assert_eq!(w.from_channel.recv().await.unwrap(), ack(1));
        w.to_channel.send(data(2, 100, 2)).await.unwrap();
        assert_eq!(w.from_channel.recv().await.unwrap(), ack(2));

        let (ch, out) = handle.await;
        assert!(ch.is_done());
        assert_eq!(ch.transfer_size(), STRIDE_SIZE + 100);
        assert_eq!(&out[..STRIDE_SIZE], &[1u8; STRIDE_SIZE][..]);
        assert_eq!(&out[STRIDE_SIZE..], &[2u8; 100][..]);
    }

    #[async_std::test]
    async fn rx_short_block_is_final() {
        let w = wire();
        w.to_channel.send(data(1, 300, 1)).await.unwrap();
        w.to_channel.send(data(2, 100, 2)).await.unwrap();

        let mut ch = RxChannel::accept(w.inbound, w.outbound, PATIENT).await.unwrap();
        let mut buf = [0u8; 400];
        assert_eq!(ch.read(&mut buf).await.unwrap(), 300);
        assert!(ch.is_done());
        assert_eq!(ch.read(&mut buf).await.unwrap(), 0);

        drop(ch);
        assert_eq!(drain(&w.from_channel).await, vec![ack(0), ack(1)]);
    }

    #[async_std::test]
    async fn rx_read_serves_buffer_first() {
        let w = wire();
        w.to_channel.send(data(1, STRIDE_SIZE, 9)).await.unwrap();

        let mut ch = RxChannel::accept(w.inbound, w.outbound, PATIENT).await.unwrap();
        let mut small = [0u8; 100];
        assert_eq!(ch.read(&mut small).await.unwrap(), 100);

        // The rest of block 1 comes back without waiting for block 2.
        let mut big = [0u8; 1000];
        assert_eq!(ch.read(&mut big).await.unwrap(), STRIDE_SIZE - 100);
        assert!(!ch.is_done());
        assert_eq!(ch.read(&mut []).await.unwrap(), 0);
    }

    #[async_std::test]
    async fn rx_duplicate_block_is_acked_once_stored() {
        let w = wire();
        w.to_channel.send(data(1, STRIDE_SIZE, 1)).await.unwrap();
        w.to_channel.send(data(1, STRIDE_SIZE, 1)).await.unwrap();
        w.to_channel.send(data(2, 10, 2)).await.unwrap();

        let mut ch = RxChannel::accept(w.inbound, w.outbound, PATIENT).await.unwrap();
        let mut out = Vec::new();
        assert_eq!(ch.read_to_end(&mut out).await.unwrap(), STRIDE_SIZE + 10);
        assert_eq!(out.len(), STRIDE_SIZE + 10);

        drop(ch);
        assert_eq!(drain(&w.from_channel).await, vec![ack(0), ack(1), ack(1), ack(2)]);
    }

    #[async_std::test]
    async fn rx_block_numbers_wrap() {
        let w = wire();
        w.to_channel.send(data(0, STRIDE_SIZE, 0)).await.unwrap();
        w.to_channel.send(data(1, 5, 1)).await.unwrap();

        let mut ch = RxChannel::accept(w.inbound, w.outbound, PATIENT).await.unwrap();
        ch.blk = 65535;

        let mut out = Vec::new();
        ch.read_to_end(&mut out).await.unwrap();
        assert!(ch.is_done());
        assert_eq!(out.len(), STRIDE_SIZE + 5);

        drop(ch);
        assert_eq!(drain(&w.from_channel).await, vec![ack(0), ack(0), ack(1)]);
    }

    #[async_std::test]
    async fn rx_rejects_non_data() {
        let w = wire();
        w.to_channel.send(ack(3)).await.unwrap();

        let mut ch = RxChannel::accept(w.inbound, w.outbound, PATIENT).await.unwrap();
        let mut buf = [0u8; 10];
        match ch.read(&mut buf).await {
            Err(TransferError::IllegalOperation { opcode: 4 }) => {}
            other => panic!("Unexpected result {:?}", other),
        }
        assert!(ch.is_err());
        assert!(matches!(ch.read(&mut buf).await, Err(TransferError::Terminated)));

        assert_eq!(
            drain(&w.from_channel).await,
            vec![ack(0), TFTPPacket::ERR(ErrorPacket::new(TFTPError::IllegalOperation))]
        );
    }

    #[async_std::test]
    async fn rx_closed_channel_ends_silently() {
        let w = wire();
        drop(w.to_channel);

        let mut ch = RxChannel::accept(w.inbound, w.outbound, PATIENT).await.unwrap();
        let mut buf = [0u8; 10];
        assert!(matches!(ch.read(&mut buf).await, Err(TransferError::ChannelClosed)));
        assert_eq!(drain(&w.from_channel).await, vec![ack(0)]);
    }

    #[async_std::test]
    async fn rx_request_retransmits_rrq() {
        let w = wire();
        let rrq = ReadRequestPacket::new("boot.img", "octet");
        let mut ch = RxChannel::request(w.inbound, w.outbound, HASTY, rrq.clone()).await.unwrap();

        let mut buf = [0u8; 10];
        match ch.read(&mut buf).await {
            Err(TransferError::ProtocolTimeout { blk: 1, attempts: 3 }) => {}
            other => panic!("Unexpected result {:?}", other),
        }

        let sent = drain(&w.from_channel).await;
        assert_eq!(sent.len(), 4);
        assert!(sent[..3].iter().all(|p| *p == TFTPPacket::RRQ(rrq.clone())));
        let timed_out = ErrorPacket::new_custom(String::from("Transfer timed out"));
        assert_eq!(sent[3], TFTPPacket::ERR(timed_out));
    }

    #[async_std::test]
    async fn rx_peer_error_ends_transfer() {
        let w = wire();
        w.to_channel
            .send(TFTPPacket::ERR(ErrorPacket::new(TFTPError::FileNotFound))).await.unwrap();

        let rrq = ReadRequestPacket::new("missing", "octet");
        let mut ch = RxChannel::request(w.inbound, w.outbound, PATIENT, rrq).await.unwrap();
        let mut buf = [0u8; 10];
        match ch.read(&mut buf).await {
            Err(TransferError::Peer { code: 1, message }) => assert_eq!(message, "File not found."),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[async_std::test]
    async fn rx_repeated_final_block_is_acked_while_dallying() {
        let w = wire();
        w.to_channel.send(data(1, 5, 1)).await.unwrap();

        let mut ch = RxChannel::accept(w.inbound, w.outbound, HASTY).await.unwrap();
        let mut out = Vec::new();
        assert_eq!(ch.read_to_end(&mut out).await.unwrap(), 5);

        // ACK #1 never reached the peer, so it sends block 1 again.
        w.to_channel.send(data(1, 5, 1)).await.unwrap();
        ch.dally().await;

        assert_eq!(drain(&w.from_channel).await, vec![ack(0), ack(1), ack(1)]);
        assert!(w.to_channel.send(data(1, 5, 1)).await.is_err());
        assert_eq!(out, vec![1u8; 5]);
    }

    #[async_std::test]
    async fn rx_dally_needs_a_finished_transfer() {
        let w = wire();
        let mut ch = RxChannel::accept(w.inbound, w.outbound, HASTY).await.unwrap();
        ch.dally().await;

        // Still open: block 1 is read as usual.
        w.to_channel.send(data(1, 3, 4)).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(ch.read(&mut buf).await.unwrap(), 3);
        assert!(ch.is_done());
    }
}
