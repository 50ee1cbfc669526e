//! TFTP (RFC 1350) peer.
//!
//! [`tftp::shared`] encodes and decodes the five packet kinds in either
//! byte order and turns the stop-and-wait block exchange of one transfer
//! into plain reads and writes. [`tftp::server`] and [`tftp::client`]
//! put those transfers on a UDP socket.

pub mod tftp;
