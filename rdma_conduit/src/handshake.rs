//! Connection metadata exchanged over the TCP bootstrap.
//!
//! Each side sends one packed little-endian header followed by its user data:
//!
//! ```text
//! u16 local_device_id | u32 queue_pair_number | u32 sequence_number | u32 user_data_size
//! ```
use std::io::Read;
use std::io::Write;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::config::MAX_CONNECTION_USER_DATA_SIZE;
use crate::error::Error;
use crate::error::Result;

/// Size of the packed header preceding the user data.
pub const HANDSHAKE_HEADER_SIZE: usize = 14;

/// What one side of a connection tells the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub local_device_id: u16,
    pub queue_pair_number: u32,
    pub sequence_number: u32,
    pub user_data: Vec<u8>,
}

pub(crate) fn check_user_data_size(size: usize) -> Result<()> {
    if size >= MAX_CONNECTION_USER_DATA_SIZE {
        return Err(Error::UserDataTooLarge {
            size,
            limit: MAX_CONNECTION_USER_DATA_SIZE,
        });
    }
    Ok(())
}

impl HandshakeMessage {
    pub fn encode(&self) -> Result<BytesMut> {
        check_user_data_size(self.user_data.len())?;
        let mut bytes = BytesMut::with_capacity(HANDSHAKE_HEADER_SIZE + self.user_data.len());
        bytes.put_u16_le(self.local_device_id);
        bytes.put_u32_le(self.queue_pair_number);
        bytes.put_u32_le(self.sequence_number);
        bytes.put_u32_le(self.user_data.len() as u32);
        bytes.put_slice(&self.user_data);
        Ok(bytes)
    }

    /// Writes the whole message, failing on a short write.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        writer.write_all(&bytes).map_err(Error::Handshake)?;
        writer.flush().map_err(Error::Handshake)
    }

    /// Reads one whole message, failing on a short read or oversized user data.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HANDSHAKE_HEADER_SIZE];
        reader.read_exact(&mut header).map_err(Error::Handshake)?;
        let mut header = &header[..];
        let local_device_id = header.get_u16_le();
        let queue_pair_number = header.get_u32_le();
        let sequence_number = header.get_u32_le();
        let size = header.get_u32_le() as usize;
        check_user_data_size(size)?;

        let mut user_data = vec![0u8; size];
        reader.read_exact(&mut user_data).map_err(Error::Handshake)?;
        Ok(Self {
            local_device_id,
            queue_pair_number,
            sequence_number,
            user_data,
        })
    }
}
