//! ACK packets are acknowledged by  DATA  or ERROR packets.
//! the opcode is 4.
//!
//! The  block  number  in an  ACK echoes
//! the block number of the DATA packet being acknowledged.
//!
//! A WRQ is acknowledged with an ACK packet having a
//! block number of zero.

use std::io;
use std::io::{Read, Write};

use crate::tftp::shared::{truncated, Deserializable, Endianness, Serializable, TFTPPacketError};

const BLK_NUM_LEN: usize = 2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckPacket {
    blk: u16,
}

impl AckPacket {
    pub fn new(blk: u16) -> Self {
        AckPacket { blk }
    }

    pub fn blk(&self) -> u16 {
        self.blk
    }
}

impl Serializable for AckPacket {
    fn serialize_body<W: Write>(&self, order: Endianness, w: &mut W) -> io::Result<usize> {
        order.write_u16(w, self.blk)?;
        Ok(BLK_NUM_LEN)
    }
}

impl Deserializable for AckPacket {
    fn deserialize<R: Read>(r: &mut R, order: Endianness) -> Result<Self, TFTPPacketError> {
        let blk = order.read_u16(r).map_err(truncated("block number"))?;
        Ok(AckPacket::new(blk))
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{LittleEndian, NetworkEndian, WriteBytesExt};

    use crate::tftp::shared::ack_packet::AckPacket;
    use crate::tftp::shared::{parse_udp_packet, Endianness, TFTPPacket, TFTPPacketError, OP_ACK};

    #[test]
    fn serialize_ack_packet() {
        let blk = 42;
        let p = TFTPPacket::ACK(AckPacket::new(blk));

        let mut buf: Vec<u8> = Vec::new();
        buf.write_u16::<NetworkEndian>(OP_ACK).unwrap();
        buf.write_u16::<NetworkEndian>(blk).unwrap();

        assert_eq!(p.serialize(Endianness::Big), buf);
    }

    #[test]
    fn deserialize_ack_packet() {
        let blk = 42;
        let mut buf: Vec<u8> = Vec::new();
        buf.write_u16::<LittleEndian>(OP_ACK).unwrap();
        buf.write_u16::<LittleEndian>(blk).unwrap();

        match parse_udp_packet(&buf).unwrap() {
            (TFTPPacket::ACK(d), Endianness::Little) => assert_eq!(d, AckPacket::new(blk)),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn deserialize_error() {
        let buf: Vec<u8> = vec![0x0, 0x4, 0x1];
        assert!(matches!(parse_udp_packet(&buf), Err(TFTPPacketError::Malformed(_))));
    }
}
