use std::io;
use std::io::{Read, Write};

use crate::tftp::shared::{
    truncated, Deserializable, Endianness, Serializable, TFTPPacketError, STRIDE_SIZE,
};

const BLK_NUM_LEN: usize = 2;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataPacket {
    blk: u16,
    data: Vec<u8>,
}

impl DataPacket {
    pub fn new(blk: u16, data: Vec<u8>) -> Self {
        DataPacket { blk, data }
    }

    pub fn blk(&self) -> u16 {
        self.blk
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A block shorter than the stride ends the transfer.
    pub fn is_last(&self) -> bool {
        self.data.len() < STRIDE_SIZE
    }
}

impl Serializable for DataPacket {
    fn serialize_body<W: Write>(&self, order: Endianness, w: &mut W) -> io::Result<usize> {
        order.write_u16(w, self.blk)?;
        w.write_all(&self.data)?;

        Ok(BLK_NUM_LEN + self.data.len())
    }
}

impl Deserializable for DataPacket {
    fn deserialize<R: Read>(r: &mut R, order: Endianness) -> Result<Self, TFTPPacketError> {
        let blk = order.read_u16(r).map_err(truncated("block number"))?;

        // One byte past the stride tells an oversized payload apart.
        let mut data = Vec::with_capacity(STRIDE_SIZE);
        r.take(STRIDE_SIZE as u64 + 1).read_to_end(&mut data)?;

        if data.len() > STRIDE_SIZE {
            return Err(TFTPPacketError::Malformed(String::from("Invalid data length")));
        }

        Ok(DataPacket::new(blk, data))
    }
}
