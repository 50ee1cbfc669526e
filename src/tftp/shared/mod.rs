use std::fmt;
use std::fmt::{Display, Formatter};
use std::io;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::tftp::shared::ack_packet::AckPacket;
use crate::tftp::shared::data_packet::DataPacket;
use crate::tftp::shared::err_packet::ErrorPacket;
use crate::tftp::shared::request_packet::*;

pub mod ack_packet;
pub mod data_channel;
pub mod data_packet;
pub mod err_packet;
pub mod request_packet;

/// Length of the OpCode field in bytes.
pub(crate) const OP_LEN: usize = 2;
/// Stride size for reading / writing files.
pub const STRIDE_SIZE: usize = 512;
/// Op code for Read Request
pub const OP_RRQ: u16 = 0x001;
/// Op code for Write Request
pub const OP_WRQ: u16 = 0x002;
/// Op code for Data packet
pub const OP_DATA: u16 = 0x003;
/// Op code for ACK packet
pub const OP_ACK: u16 = 0x004;
/// Op code for Error packet
pub const OP_ERR: u16 = 0x005;

/// Byte order of the integer fields of a packet.
///
/// RFC 1350 never fixes one, so it is detected from the opcode of the
/// first packet of a transfer and every reply reuses it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub fn read_u16<R: Read>(self, r: &mut R) -> io::Result<u16> {
        match self {
            Endianness::Big => r.read_u16::<BigEndian>(),
            Endianness::Little => r.read_u16::<LittleEndian>(),
        }
    }

    pub fn write_u16<W: Write>(self, w: &mut W, value: u16) -> io::Result<()> {
        match self {
            Endianness::Big => w.write_u16::<BigEndian>(value),
            Endianness::Little => w.write_u16::<LittleEndian>(value),
        }
    }
}

impl Display for Endianness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Big => write!(f, "big-endian"),
            Endianness::Little => write!(f, "little-endian"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TFTPPacket {
    RRQ(ReadRequestPacket),
    WRQ(WriteRequestPacket),
    ACK(AckPacket),
    ERR(ErrorPacket),
    DATA(DataPacket),
}

impl TFTPPacket {
    pub fn op(&self) -> u16 {
        match self {
            TFTPPacket::RRQ(_) => OP_RRQ,
            TFTPPacket::WRQ(_) => OP_WRQ,
            TFTPPacket::ACK(_) => OP_ACK,
            TFTPPacket::ERR(_) => OP_ERR,
            TFTPPacket::DATA(_) => OP_DATA,
        }
    }

    /// Reads one packet from `r` and reports the byte order it was
    /// written in.
    ///
    /// Legal opcodes are 1 through 5, so the opcode is read as little
    /// endian first; anything above 5 means the bytes were swapped, the
    /// real opcode sits in the high byte and the packet is big endian.
    pub fn decode<R: Read>(r: &mut R) -> Result<(TFTPPacket, Endianness), TFTPPacketError> {
        let raw = r.read_u16::<LittleEndian>().map_err(truncated("opcode"))?;
        let (op, order) = if raw > OP_ERR {
            (raw >> 8, Endianness::Big)
        } else {
            (raw, Endianness::Little)
        };

        let packet = match op {
            OP_RRQ => TFTPPacket::RRQ(ReadRequestPacket::deserialize(r, order)?),
            OP_WRQ => TFTPPacket::WRQ(WriteRequestPacket::deserialize(r, order)?),
            OP_DATA => TFTPPacket::DATA(DataPacket::deserialize(r, order)?),
            OP_ACK => TFTPPacket::ACK(AckPacket::deserialize(r, order)?),
            OP_ERR => TFTPPacket::ERR(ErrorPacket::deserialize(r, order)?),
            val => return Err(TFTPPacketError::UnknownOpcode(val)),
        };

        Ok((packet, order))
    }

    /// Writes the opcode then the packet fields in `order`, returning the
    /// number of bytes written.
    pub fn encode<W: Write>(&self, order: Endianness, w: &mut W) -> Result<usize, TFTPPacketError> {
        order.write_u16(w, self.op())?;
        let body = match self {
            TFTPPacket::RRQ(p) => p.serialize_body(order, w)?,
            TFTPPacket::WRQ(p) => p.serialize_body(order, w)?,
            TFTPPacket::ACK(p) => p.serialize_body(order, w)?,
            TFTPPacket::ERR(p) => p.serialize_body(order, w)?,
            TFTPPacket::DATA(p) => p.serialize_body(order, w)?,
        };

        Ok(OP_LEN + body)
    }

    pub fn serialize(&self, order: Endianness) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writes into a Vec never fail.
        let _ = self.encode(order, &mut buf);
        buf
    }
}

impl Display for TFTPPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let desc = match self {
            TFTPPacket::RRQ(p) => format!("RRQ [{}] [{}]", p.filename(), p.mode()),
            TFTPPacket::WRQ(p) => format!("WRQ [{}] [{}]", p.filename(), p.mode()),
            TFTPPacket::ACK(p) => format!("ACK [{}]", p.blk()),
            TFTPPacket::ERR(p) => format!("ERR [{}]: {}", p.code(), p.err()),
            TFTPPacket::DATA(p) => format!("DATA [{}] ({} bytes)", p.blk(), p.len()),
        };

        write!(f, "{}", desc)
    }
}

/// Packet fields that follow the opcode.
pub trait Serializable {
    fn serialize_body<W: Write>(&self, order: Endianness, w: &mut W) -> io::Result<usize>;
}

/// Parses the fields that follow an already consumed opcode.
pub trait Deserializable: Sized {
    fn deserialize<R: Read>(r: &mut R, order: Endianness) -> Result<Self, TFTPPacketError>;
}

/// Decodes a whole datagram.
pub fn parse_udp_packet(buf: &[u8]) -> Result<(TFTPPacket, Endianness), TFTPPacketError> {
    TFTPPacket::decode(&mut Cursor::new(buf))
}

#[derive(Debug, Error)]
pub enum TFTPPacketError {
    #[error("Failed to parse packet: {0}")]
    Malformed(String),
    #[error("Invalid opcode [{0}]")]
    UnknownOpcode(u16),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Maps a premature end of input while reading `field` to a malformed
/// packet, any other failure stays an I/O error.
pub(crate) fn truncated(field: &'static str) -> impl FnOnce(io::Error) -> TFTPPacketError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TFTPPacketError::Malformed(format!("truncated {}", field))
        } else {
            TFTPPacketError::Io(e)
        }
    }
}

/// Reads a NUL terminated string.
pub(crate) fn read_string<R: Read>(
    r: &mut R,
    field: &'static str,
) -> Result<String, TFTPPacketError> {
    let mut bytes = Vec::new();
    loop {
        match r.read_u8() {
            Ok(0) => break,
            Ok(b) => bytes.push(b),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TFTPPacketError::Malformed(format!("unterminated {}", field)));
            }
            Err(e) => return Err(TFTPPacketError::Io(e)),
        }
    }

    String::from_utf8(bytes)
        .map_err(|_| TFTPPacketError::Malformed(format!("{} is not valid UTF-8", field)))
}

pub(crate) fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<usize> {
    w.write_all(s.as_bytes())?;
    w.write_u8(0)?;
    Ok(s.len() + 1)
}
