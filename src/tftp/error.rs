//! Errors that end a single transfer.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The dispatcher closed one of the transfer's packet channels.
    #[error("Packet channel closed")]
    ChannelClosed,

    /// The peer sent a packet that is not valid in the current state.
    #[error("Illegal TFTP operation: unexpected opcode [{opcode}]")]
    IllegalOperation { opcode: u16 },

    /// Nothing usable arrived within the retry budget.
    #[error("No reply while waiting for block [{blk}] after {attempts} attempts")]
    ProtocolTimeout { blk: u16, attempts: u32 },

    /// The peer gave up and told us why.
    #[error("Peer error [{code}]: {message}")]
    Peer { code: u16, message: String },

    /// We refused the request before any data moved.
    #[error("Request rejected [{code}]: {message}")]
    Rejected { code: u16, message: String },

    #[error("Transfer already terminated")]
    Terminated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;
