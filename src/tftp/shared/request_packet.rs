use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::tftp::shared::{
    read_string, write_string, Deserializable, Endianness, Serializable, TFTPPacketError,
};

pub trait Request: Serializable + Deserializable {
    fn filename(&self) -> &str;
    fn mode(&self) -> &str;

    /// The requested transfer mode, if it is one RFC 1350 knows about.
    fn transfer_mode(&self) -> Option<TransferMode> {
        self.mode().parse().ok()
    }
}

/// Transfer modes named by RFC 1350. Mode strings are case-insensitive.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferMode {
    NetAscii,
    Octet,
    Mail,
}

impl TransferMode {
    /// Whether files can be moved in this mode. Both supported modes are
    /// served byte for byte.
    pub fn is_supported(self) -> bool {
        matches!(self, TransferMode::NetAscii | TransferMode::Octet)
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::NetAscii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            other => Err(format!("unknown transfer mode [{}]", other)),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferMode::NetAscii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadRequestPacket {
    req: RequestPacket,
}

impl ReadRequestPacket {
    pub fn new(filename: &str, mode: &str) -> ReadRequestPacket {
        ReadRequestPacket {
            req: RequestPacket::new(filename, mode),
        }
    }
}

impl Request for ReadRequestPacket {
    fn filename(&self) -> &str {
        &self.req.filename
    }

    fn mode(&self) -> &str {
        &self.req.mode
    }
}

impl Serializable for ReadRequestPacket {
    fn serialize_body<W: Write>(&self, order: Endianness, w: &mut W) -> io::Result<usize> {
        self.req.serialize_body(order, w)
    }
}

impl Deserializable for ReadRequestPacket {
    fn deserialize<R: Read>(r: &mut R, order: Endianness) -> Result<Self, TFTPPacketError> {
        RequestPacket::deserialize(r, order).map(|req| ReadRequestPacket { req })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WriteRequestPacket {
    req: RequestPacket,
}

impl WriteRequestPacket {
    pub fn new(filename: &str, mode: &str) -> WriteRequestPacket {
        WriteRequestPacket {
            req: RequestPacket::new(filename, mode),
        }
    }
}

impl Request for WriteRequestPacket {
    fn filename(&self) -> &str {
        &self.req.filename
    }

    fn mode(&self) -> &str {
        &self.req.mode
    }
}

impl Serializable for WriteRequestPacket {
    fn serialize_body<W: Write>(&self, order: Endianness, w: &mut W) -> io::Result<usize> {
        self.req.serialize_body(order, w)
    }
}

impl Deserializable for WriteRequestPacket {
    fn deserialize<R: Read>(r: &mut R, order: Endianness) -> Result<Self, TFTPPacketError> {
        RequestPacket::deserialize(r, order).map(|req| WriteRequestPacket { req })
    }
}

/// Body shared by RRQ and WRQ: `filename NUL mode NUL`.
#[derive(Debug, Clone, Eq, PartialEq)]
struct RequestPacket {
    filename: String,
    mode: String,
}

impl RequestPacket {
    fn new(filename: &str, mode: &str) -> Self {
        RequestPacket {
            filename: String::from(filename),
            mode: String::from(mode),
        }
    }
}

impl Serializable for RequestPacket {
    fn serialize_body<W: Write>(&self, _order: Endianness, w: &mut W) -> io::Result<usize> {
        let n = write_string(w, &self.filename)?;
        Ok(n + write_string(w, &self.mode)?)
    }
}

impl Deserializable for RequestPacket {
    fn deserialize<R: Read>(r: &mut R, _order: Endianness) -> Result<Self, TFTPPacketError> {
        let filename = read_string(r, "filename")?;
        let mode = read_string(r, "mode")?;

        Ok(RequestPacket { filename, mode })
    }
}
