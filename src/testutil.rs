//! Writer for synthetic signed packages used by unit tests.

use crate::signing_block::{
    SigningBlockHead, SubBlockHead, MAGIC_HIGH, MAGIC_HIGH_OLD, MAGIC_LOW, MAGIC_LOW_OLD,
    SIGNATURE_BLOCK_TYPE, SUB_BLOCK_HEAD_LEN, ZIP_EOCD_SEGMENT_FLAG,
};

pub(crate) struct BuiltPackage {
    pub bytes: Vec<u8>,
    pub signing_block_offset: u64,
    pub central_dir_offset: u64,
    pub eocd_offset: u64,
}

impl BuiltPackage {
    pub fn entries(&self) -> &[u8] {
        &self.bytes[..self.signing_block_offset as usize]
    }

    pub fn central_dir(&self) -> &[u8] {
        &self.bytes[self.central_dir_offset as usize..self.eocd_offset as usize]
    }
}

pub(crate) struct PackageBuilder {
    entries: Vec<u8>,
    central_dir: Vec<u8>,
    version: i32,
    blocks: Vec<(u32, Vec<u8>)>,
    comment: Vec<u8>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        let mut entries = b"PK\x03\x04".to_vec();
        entries.extend((0..300u32).map(|i| (i * 7 % 251) as u8));
        let mut central_dir = b"PK\x01\x02".to_vec();
        central_dir.extend((0..60u32).map(|i| (i * 13 % 241) as u8));
        PackageBuilder {
            entries,
            central_dir,
            version: 3,
            blocks: vec![],
            comment: vec![],
        }
    }

    pub fn entries(mut self, entries: Vec<u8>) -> Self {
        self.entries = entries;
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn signature(self, value: Vec<u8>) -> Self {
        self.optional(SIGNATURE_BLOCK_TYPE, value)
    }

    pub fn optional(mut self, block_type: u32, value: Vec<u8>) -> Self {
        self.blocks.push((block_type, value));
        self
    }

    pub fn comment(mut self, comment: Vec<u8>) -> Self {
        self.comment = comment;
        self
    }

    pub fn build(self) -> BuiltPackage {
        let headers_len = self.blocks.len() * SUB_BLOCK_HEAD_LEN;
        let mut headers = vec![];
        let mut payloads: Vec<u8> = vec![];
        for (block_type, value) in &self.blocks {
            let head = SubBlockHead {
                block_type: *block_type,
                length: value.len() as u32,
                offset: (headers_len + payloads.len()) as u32,
                reserved: 0,
            };
            headers.extend(bincode::serialize(&head).unwrap());
            payloads.extend(value);
        }
        let block_array_len = headers.len() + payloads.len();
        let (magic_low, magic_high) = if self.version >= 3 {
            (MAGIC_LOW, MAGIC_HIGH)
        } else {
            (MAGIC_LOW_OLD, MAGIC_HIGH_OLD)
        };
        let head = SigningBlockHead {
            block_count: self.blocks.len() as i32,
            block_array_len: block_array_len as i64,
            magic_low,
            magic_high,
            version: self.version,
        };

        let signing_block_offset = self.entries.len() as u64;
        let central_dir_offset = signing_block_offset + block_array_len as u64 + 32;
        let eocd_offset = central_dir_offset + self.central_dir.len() as u64;

        let mut bytes = self.entries;
        bytes.extend(headers);
        bytes.extend(payloads);
        bytes.extend(bincode::serialize(&head).unwrap());
        bytes.extend(&self.central_dir);
        bytes.extend(eocd(
            self.central_dir.len() as u32,
            central_dir_offset as u32,
            &self.comment,
        ));

        BuiltPackage {
            bytes,
            signing_block_offset,
            central_dir_offset,
            eocd_offset,
        }
    }
}

pub(crate) fn eocd(central_dir_size: u32, central_dir_offset: u32, comment: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    out.extend(ZIP_EOCD_SEGMENT_FLAG.to_le_bytes());
    out.extend(0u16.to_le_bytes());
    out.extend(0u16.to_le_bytes());
    out.extend(1u16.to_le_bytes());
    out.extend(1u16.to_le_bytes());
    out.extend(central_dir_size.to_le_bytes());
    out.extend(central_dir_offset.to_le_bytes());
    out.extend((comment.len() as u16).to_le_bytes());
    out.extend(comment);
    out
}
