//! Region tokens: serializable capabilities for remote memory.
//!
//! A [`RegionToken`] is a snapshot of a registered region's address, size and keys. It
//! is a plain value: it can be copied, sent to a peer in connection user data or any
//! other channel, and used there as the target of one-sided operations. It does not keep
//! the region alive; a token that outlives its region makes the peer's operations fail
//! with a remote access error.
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::RegionSide;
use crate::error::Result;

/// Size of a token in its external representation.
pub const REGION_TOKEN_SIZE: usize = 28;

/// What kind of memory a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    Buffer,
    Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionToken {
    size: u64,
    address: u64,
    local_key: u32,
    remote_key: u32,
    kind: RegionKind,
}

impl RegionToken {
    pub fn new(kind: RegionKind, size: u64, address: u64, local_key: u32, remote_key: u32) -> Self {
        Self {
            size,
            address,
            local_key,
            remote_key,
            kind,
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size
    }

    /// Bytes left in the region after `offset`; zero when `offset` is past the end.
    pub fn remaining_size_in_bytes(&self, offset: u64) -> u64 {
        self.size.saturating_sub(offset)
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn address_with_offset(&self, offset: u64) -> u64 {
        self.address + offset
    }

    pub fn local_key(&self) -> u32 {
        self.local_key
    }

    pub fn remote_key(&self) -> u32 {
        self.remote_key
    }

    /// A token for `size` bytes starting `offset` bytes into this one.
    pub fn slice(&self, offset: u64, size: u64) -> Result<RegionToken> {
        check_range(RegionSide::Local, self.size, offset, size)?;
        Ok(RegionToken {
            size,
            address: self.address + offset,
            ..*self
        })
    }

    /// Encodes the token as `{size, address, local_key, remote_key, kind}`, little-endian.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<RegionToken> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Registered memory that can be named by a [`RegionToken`].
pub trait Region {
    fn kind(&self) -> RegionKind;

    fn size_in_bytes(&self) -> u64;

    /// Address of the first byte of the region.
    fn address(&self) -> u64;

    fn local_key(&self) -> u32;

    fn remote_key(&self) -> u32;

    fn remaining_size_in_bytes(&self, offset: u64) -> u64 {
        self.size_in_bytes().saturating_sub(offset)
    }

    /// A token covering the whole region.
    fn create_token(&self) -> RegionToken {
        RegionToken::new(
            self.kind(),
            self.size_in_bytes(),
            self.address(),
            self.local_key(),
            self.remote_key(),
        )
    }

    /// A token covering the region from `offset` to its end.
    fn create_token_from(&self, offset: u64) -> Result<RegionToken> {
        self.create_token_range(offset, self.remaining_size_in_bytes(offset))
    }

    /// A token covering `size` bytes starting at `offset`.
    fn create_token_range(&self, offset: u64, size: u64) -> Result<RegionToken> {
        self.create_token().slice(offset, size)
    }
}

/// Checks that `[offset, offset + size)` lies within a region of `available` bytes.
pub(crate) fn check_range(side: RegionSide, available: u64, offset: u64, size: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= available => Ok(()),
        _ => Err(Error::OutOfBounds {
            side,
            offset,
            requested: size,
            available,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> RegionToken {
        RegionToken::new(RegionKind::Buffer, 4096, 0x10000, 11, 12)
    }

    #[test]
    fn test_accessors() {
        let token = token();
        assert_eq!(token.kind(), RegionKind::Buffer);
        assert_eq!(token.size_in_bytes(), 4096);
        assert_eq!(token.address(), 0x10000);
        assert_eq!(token.local_key(), 11);
        assert_eq!(token.remote_key(), 12);
    }

    #[test]
    fn test_remaining_size() {
        let token = token();
        assert_eq!(token.remaining_size_in_bytes(0), 4096);
        assert_eq!(token.remaining_size_in_bytes(96), 4000);
        assert_eq!(token.remaining_size_in_bytes(5000), 0);
        assert_eq!(token.address_with_offset(96), 0x10060);
    }

    #[test]
    fn test_slice() {
        let slice = token().slice(1024, 512).unwrap();
        assert_eq!(slice.address(), 0x10400);
        assert_eq!(slice.remaining_size_in_bytes(0), 512);
        assert_eq!(slice.remote_key(), 12);
        assert!(token().slice(4000, 100).is_err());
        assert!(token().slice(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_wire_format() {
        let bytes = token().to_bytes().unwrap();
        assert_eq!(bytes.len(), REGION_TOKEN_SIZE);
        assert_eq!(&bytes[0..8], &4096u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x10000u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &11u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &12u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &0u32.to_le_bytes());
        assert_eq!(RegionToken::from_bytes(&bytes).unwrap(), token());
    }

    #[test]
    fn test_from_truncated_bytes() {
        let bytes = token().to_bytes().unwrap();
        assert!(RegionToken::from_bytes(&bytes[..10]).is_err());
    }
}
