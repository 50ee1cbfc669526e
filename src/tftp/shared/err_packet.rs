//! ERROR packet can be the acknowledgment of any other type of packet.
//! The error code is an integer indicating the nature of the error.  A
//! table of values and meanings is given in the appendix.  (Note that
//! several error codes have been added to this version of this
//! document.) The error message is intended for human consumption, and
//! should be in netascii.  Like all other strings, it is terminated with
//! a zero byte.

use std::io;
use std::io::{Read, Write};

use crate::tftp::shared::{
    read_string, truncated, write_string, Deserializable, Endianness, Serializable,
    TFTPPacketError,
};

const ERR_CODE_LEN: usize = 2;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorPacket {
    code: u16,
    err: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TFTPError {
    UndefinedError,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTID,
    FileExists,
    NoSuchUser,
}

impl TFTPError {
    pub fn code(self) -> u16 {
        match self {
            TFTPError::UndefinedError => 0,
            TFTPError::FileNotFound => 1,
            TFTPError::AccessViolation => 2,
            TFTPError::DiskFull => 3,
            TFTPError::IllegalOperation => 4,
            TFTPError::UnknownTID => 5,
            TFTPError::FileExists => 6,
            TFTPError::NoSuchUser => 7,
        }
    }

    pub fn from_code(code: u16) -> Option<TFTPError> {
        match code {
            0 => Some(TFTPError::UndefinedError),
            1 => Some(TFTPError::FileNotFound),
            2 => Some(TFTPError::AccessViolation),
            3 => Some(TFTPError::DiskFull),
            4 => Some(TFTPError::IllegalOperation),
            5 => Some(TFTPError::UnknownTID),
            6 => Some(TFTPError::FileExists),
            7 => Some(TFTPError::NoSuchUser),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            TFTPError::UndefinedError => "Not defined, see error message (if any).",
            TFTPError::FileNotFound => "File not found.",
            TFTPError::AccessViolation => "Access violation.",
            TFTPError::DiskFull => "Disk full or allocation exceeded.",
            TFTPError::IllegalOperation => "Illegal TFTP operation.",
            TFTPError::UnknownTID => "Unknown transfer ID.",
            TFTPError::FileExists => "File already exists.",
            TFTPError::NoSuchUser => "No such user.",
        }
    }
}

impl ErrorPacket {
    /// An error carrying the standard message for `err`.
    pub fn new(err: TFTPError) -> Self {
        ErrorPacket::with_message(err, err.message())
    }

    pub fn with_message(err: TFTPError, msg: &str) -> Self {
        ErrorPacket {
            code: err.code(),
            err: msg.to_string(),
        }
    }

    /// An undefined (code 0) error with a free form message.
    pub fn new_custom(msg: String) -> Self {
        ErrorPacket {
            code: TFTPError::UndefinedError.code(),
            err: msg,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The error kind, `None` for codes outside the RFC 1350 table.
    pub fn kind(&self) -> Option<TFTPError> {
        TFTPError::from_code(self.code)
    }

    pub fn err(&self) -> &str {
        &self.err
    }
}

impl Serializable for ErrorPacket {
    fn serialize_body<W: Write>(&self, order: Endianness, w: &mut W) -> io::Result<usize> {
        order.write_u16(w, self.code)?;
        Ok(ERR_CODE_LEN + write_string(w, &self.err)?)
    }
}

impl Deserializable for ErrorPacket {
    fn deserialize<R: Read>(r: &mut R, order: Endianness) -> Result<Self, TFTPPacketError> {
        let code = order.read_u16(r).map_err(truncated("error code"))?;
        let err = read_string(r, "error message")?;

        Ok(ErrorPacket { code, err })
    }
}
