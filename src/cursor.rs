//! Bounds-checked little-endian field extraction over a byte slice.

use crate::{Error, Result};

/// A read view over a byte slice with a moving position. Every accessor checks the requested
/// range against the slice so offsets taken from the package are never trusted directly.
#[derive(Clone, Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteCursor { data, position: 0 }
    }

    /// Returns `len` bytes at absolute `offset` without moving the position.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.out_of_bounds(offset, len))?;
        if end > self.data.len() {
            return Err(self.out_of_bounds(offset, len));
        }
        Ok(&self.data[offset..end])
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self.bytes_at(self.position, len)?;
        self.position += len;
        Ok(bytes)
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array_at(offset)?))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array_at(offset)?))
    }

    pub fn i32_at(&self, offset: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array_at(offset)?))
    }

    fn array_at<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes_at(offset, N)?);
        Ok(out)
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> Error {
        Error::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            limit: self.data.len() as u64,
        }
    }
}
