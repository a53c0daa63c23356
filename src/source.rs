//! Readable spans of package bytes that feed the digest engine without loading whole regions
//! into memory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::digest::DigestParameter;
use crate::{Error, Result};

/// Random access to the bytes of a package, either a file or an in-memory buffer.
pub trait PackageData {
    fn size(&self) -> Result<u64>;

    /// Fills `buf` completely from `offset` or fails.
    fn read_fully_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl PackageData for [u8] {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_fully_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let out_of_bounds = || Error::OutOfBounds {
            offset,
            len: buf.len() as u64,
            limit: self.len() as u64,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(buf.len()).ok_or_else(out_of_bounds)?;
        if end > self.len() {
            return Err(out_of_bounds());
        }
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl PackageData for File {
    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_fully_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

/// A span of bytes consumed front to back in chunks.
pub trait ContentSource {
    fn has_remaining(&self) -> bool;

    fn remaining(&self) -> u64;

    /// Rewinds to the start of the span.
    fn reset(&mut self);

    /// Consumes the next `chunk_len` bytes into the running digest.
    fn read_and_digest(&mut self, digest: &mut DigestParameter, chunk_len: usize) -> Result<()>;
}

pub struct BufferSource<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BufferSource { data, position: 0 }
    }
}

impl ContentSource for BufferSource<'_> {
    fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    fn remaining(&self) -> u64 {
        (self.data.len() - self.position) as u64
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn read_and_digest(&mut self, digest: &mut DigestParameter, chunk_len: usize) -> Result<()> {
        let end = self
            .position
            .checked_add(chunk_len)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::OutOfBounds {
                offset: self.position as u64,
                len: chunk_len as u64,
                limit: self.data.len() as u64,
            })?;
        digest.update(&self.data[self.position..end]);
        self.position = end;
        Ok(())
    }
}

/// A region `[offset, offset + len)` of a [`PackageData`].
pub struct RegionSource<'a, P: PackageData + ?Sized> {
    data: &'a P,
    offset: u64,
    len: u64,
    position: u64,
    buffer: Vec<u8>,
}

impl<'a, P: PackageData + ?Sized> RegionSource<'a, P> {
    pub fn new(data: &'a P, offset: u64, len: u64) -> Self {
        RegionSource {
            data,
            offset,
            len,
            position: 0,
            buffer: Vec::new(),
        }
    }
}

impl<P: PackageData + ?Sized> ContentSource for RegionSource<'_, P> {
    fn has_remaining(&self) -> bool {
        self.position < self.len
    }

    fn remaining(&self) -> u64 {
        self.len - self.position
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn read_and_digest(&mut self, digest: &mut DigestParameter, chunk_len: usize) -> Result<()> {
        if chunk_len as u64 > self.remaining() {
            return Err(Error::OutOfBounds {
                offset: self.offset + self.position,
                len: chunk_len as u64,
                limit: self.offset + self.len,
            });
        }
        self.buffer.resize(chunk_len, 0);
        self.data
            .read_fully_at(self.offset + self.position, &mut self.buffer)?;
        digest.update(&self.buffer);
        self.position += chunk_len as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestAlgorithm;

    #[test]
    fn region_and_buffer_sources_agree() {
        let package: Vec<u8> = (0..=255u8).cycle().take(5000).collect();

        let mut region = RegionSource::new(package.as_slice(), 100, 1000);
        let mut buffer = BufferSource::new(&package[100..1100]);

        let mut d1 = DigestParameter::new(DigestAlgorithm::Sha256);
        let mut d2 = DigestParameter::new(DigestAlgorithm::Sha256);
        while region.has_remaining() {
            let len = region.remaining().min(300) as usize;
            region.read_and_digest(&mut d1, len).unwrap();
            buffer.read_and_digest(&mut d2, len).unwrap();
        }
        assert!(!buffer.has_remaining());
        assert_eq!(d1.finalize_reset(), d2.finalize_reset());

        region.reset();
        assert_eq!(1000, region.remaining());
    }

    #[test]
    fn over_read_is_rejected() {
        let data = [0u8; 10];
        let mut source = BufferSource::new(&data);
        let mut digest = DigestParameter::new(DigestAlgorithm::Sha256);
        assert!(source.read_and_digest(&mut digest, 11).is_err());

        let mut region = RegionSource::new(data.as_slice(), 8, 4);
        assert!(region.read_and_digest(&mut digest, 4).is_err());
    }
}
