//! Locates the signing block of a package and splits it into its sub-blocks.
//!
//! A signed package is a ZIP file with an extra region inserted between the last entry and the
//! central directory:
//!
//! ```text
//! [zip entries][sub-block headers][sub-block payloads][signing block head][central directory][eocd]
//!              ^ signing block offset                                     ^ central dir offset
//! ```
//!
//! The 32-byte head sits immediately before the central directory:
//!
//! ```text
//! struct SigningBlockHead
//! {
//!   i4  block_count      /* number of sub-blocks */
//!   i8  block_array_len  /* bytes of sub-block headers and payloads */
//!   i8  magic_low
//!   i8  magic_high
//!   i4  version
//! };
//! ```
//!
//! Sub-block headers are 16 bytes each (`type`, `length`, `offset`, reserved) and sub-block
//! offsets are relative to the signing block offset.

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::cursor::ByteCursor;
use crate::source::PackageData;
use crate::{Error, Result};

pub(crate) const ZIP_EOCD_SEG_MIN_SIZE: usize = 22;
pub(crate) const ZIP_EOCD_SEGMENT_FLAG: u32 = 0x06054b50;
pub(crate) const ZIP_CD_SIZE_OFFSET_IN_EOCD: usize = 12;
pub(crate) const ZIP_CD_OFFSET_IN_EOCD: usize = 16;
pub(crate) const ZIP_EOCD_COMMENT_LENGTH_OFFSET: usize = 20;
const ZIP_MAX_COMMENT_SIZE: usize = 0xffff;

pub(crate) const SIGNING_BLOCK_HEAD_LEN: usize = 32;
pub(crate) const SUB_BLOCK_HEAD_LEN: usize = 16;
const MAX_SIGNING_BLOCK_SIZE: i64 = 10 * 1024 * 1024;
const MAX_BLOCK_COUNT: i32 = 10;

const VERSION_FOR_NEW_MAGIC: i32 = 3;
pub(crate) const MAGIC_LOW_OLD: i64 = 0x2067695320504148;
pub(crate) const MAGIC_HIGH_OLD: i64 = 0x3234206b636f6c42;
pub(crate) const MAGIC_LOW: i64 = 0x676973207061683c;
pub(crate) const MAGIC_HIGH: i64 = 0x3e6b636f6c62206e;

pub const SIGNATURE_BLOCK_TYPE: u32 = 0x20000000;
pub const PROOF_OF_ROTATION_BLOCK_TYPE: u32 = 0x20000001;
pub const PROFILE_BLOCK_TYPE: u32 = 0x20000002;
pub const PROPERTY_BLOCK_TYPE: u32 = 0x20000003;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SigningBlockHead {
    pub block_count: i32,
    pub block_array_len: i64,
    pub magic_low: i64,
    pub magic_high: i64,
    pub version: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SubBlockHead {
    pub block_type: u32,
    pub length: u32,
    pub offset: u32,
    pub reserved: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OptionalBlockType {
    Profile,
    ProofOfRotation,
    Property,
}

impl OptionalBlockType {
    pub fn from_type_id(block_type: u32) -> Option<Self> {
        match block_type {
            PROFILE_BLOCK_TYPE => Some(OptionalBlockType::Profile),
            PROOF_OF_ROTATION_BLOCK_TYPE => Some(OptionalBlockType::ProofOfRotation),
            PROPERTY_BLOCK_TYPE => Some(OptionalBlockType::Property),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionalBlock {
    pub block_type: OptionalBlockType,
    pub value: Vec<u8>,
}

/// Everything the rest of the pipeline needs to know about where the signature lives.
#[derive(Clone, Debug)]
pub struct SignatureInfo {
    pub version: u32,
    pub signing_block_offset: u64,
    pub central_dir_offset: u64,
    pub eocd_offset: u64,
    pub eocd: Vec<u8>,
    pub signature_block: Vec<u8>,
    pub optional_blocks: Vec<OptionalBlock>,
}

impl SignatureInfo {
    /// Returns the first sub-block of the given type in discovery order.
    pub fn find_optional_block(&self, block_type: OptionalBlockType) -> Option<&OptionalBlock> {
        self.optional_blocks
            .iter()
            .find(|b| b.block_type == block_type)
    }
}

/// Finds the signing block in `package`.
pub fn locate<P: PackageData + ?Sized>(package: &P) -> Result<SignatureInfo> {
    let file_len = package.size()?;
    let (eocd_offset, eocd) = find_eocd(package, file_len)?;
    let central_dir_offset = find_central_dir_offset(&eocd, eocd_offset)?;

    let head = read_signing_block_head(package, central_dir_offset)?;
    let block_array_len = head.block_array_len as usize;
    let signing_block_offset =
        central_dir_offset - (block_array_len + SIGNING_BLOCK_HEAD_LEN) as u64;

    // bounded by MAX_SIGNING_BLOCK_SIZE in read_signing_block_head
    let mut block_array = vec![0u8; block_array_len];
    if let Err(e) = package.read_fully_at(signing_block_offset, &mut block_array) {
        error!("Failed to read sub-block array at offset {signing_block_offset}: {e:?}");
        return Err(e);
    }

    let (signature_block, optional_blocks) = split_sub_blocks(&block_array, head.block_count)?;

    Ok(SignatureInfo {
        version: head.version as u32,
        signing_block_offset,
        central_dir_offset,
        eocd_offset,
        eocd,
        signature_block,
        optional_blocks,
    })
}

/// Returns the offset and bytes (including the comment) of the end of central directory record.
fn find_eocd<P: PackageData + ?Sized>(package: &P, file_len: u64) -> Result<(u64, Vec<u8>)> {
    if file_len < ZIP_EOCD_SEG_MIN_SIZE as u64 {
        error!("File of {file_len} bytes is too small to hold an EOCD record");
        return Err(Error::Eocd(format!("file too small: {file_len} bytes")));
    }

    // Most packages carry no comment, so try the last 22 bytes first.
    let mut tail = vec![0u8; ZIP_EOCD_SEG_MIN_SIZE];
    package.read_fully_at(file_len - ZIP_EOCD_SEG_MIN_SIZE as u64, &mut tail)?;
    if let Some(pos) = eocd_position_in(&tail) {
        return Ok((file_len - (tail.len() - pos) as u64, tail));
    }

    let window = file_len.min((ZIP_MAX_COMMENT_SIZE + ZIP_EOCD_SEG_MIN_SIZE) as u64) as usize;
    let mut tail = vec![0u8; window];
    package.read_fully_at(file_len - window as u64, &mut tail)?;
    match eocd_position_in(&tail) {
        Some(pos) => {
            let eocd_offset = file_len - (window - pos) as u64;
            Ok((eocd_offset, tail.split_off(pos)))
        }
        None => {
            error!("No EOCD record within the last {window} bytes");
            Err(Error::Eocd("signature not found".to_string()))
        }
    }
}

/// Scans `tail` backwards for an EOCD record whose comment runs exactly to the end of `tail`.
fn eocd_position_in(tail: &[u8]) -> Option<usize> {
    let cursor = ByteCursor::new(tail);
    let last = tail.len().checked_sub(ZIP_EOCD_SEG_MIN_SIZE)?;
    (0..=last).rev().find(|&pos| {
        let flag = cursor.u32_at(pos).ok();
        let comment_len = cursor.u16_at(pos + ZIP_EOCD_COMMENT_LENGTH_OFFSET).ok();
        flag == Some(ZIP_EOCD_SEGMENT_FLAG)
            && comment_len.map(usize::from) == Some(tail.len() - pos - ZIP_EOCD_SEG_MIN_SIZE)
    })
}

fn find_central_dir_offset(eocd: &[u8], eocd_offset: u64) -> Result<u64> {
    let cursor = ByteCursor::new(eocd);
    let central_dir_size = cursor.u32_at(ZIP_CD_SIZE_OFFSET_IN_EOCD)? as u64;
    let central_dir_offset = cursor.u32_at(ZIP_CD_OFFSET_IN_EOCD)? as u64;
    if central_dir_offset > eocd_offset || central_dir_offset + central_dir_size != eocd_offset {
        error!(
            "Central directory offset {central_dir_offset} and size {central_dir_size} do not end at EOCD offset {eocd_offset}"
        );
        return Err(Error::CentralDirectory(format!(
            "offset {central_dir_offset} + size {central_dir_size} != eocd offset {eocd_offset}"
        )));
    }
    Ok(central_dir_offset)
}

fn read_signing_block_head<P: PackageData + ?Sized>(
    package: &P,
    central_dir_offset: u64,
) -> Result<SigningBlockHead> {
    if central_dir_offset < SIGNING_BLOCK_HEAD_LEN as u64 {
        error!("Central directory offset {central_dir_offset} leaves no room for a signing block");
        return Err(Error::SigningBlock("package too small".to_string()));
    }

    let mut raw = vec![0u8; SIGNING_BLOCK_HEAD_LEN];
    package.read_fully_at(central_dir_offset - SIGNING_BLOCK_HEAD_LEN as u64, &mut raw)?;
    let head: SigningBlockHead = match bincode::deserialize(&raw) {
        Ok(head) => head,
        Err(e) => {
            error!("Failed to parse signing block head: {e:?}");
            return Err(e.into());
        }
    };

    let (magic_low, magic_high) = if head.version >= VERSION_FOR_NEW_MAGIC {
        (MAGIC_LOW, MAGIC_HIGH)
    } else {
        (MAGIC_LOW_OLD, MAGIC_HIGH_OLD)
    };
    if head.magic_low != magic_low || head.magic_high != magic_high {
        error!("Signing block magic mismatch for version {}", head.version);
        return Err(Error::SigningBlock("bad magic".to_string()));
    }

    let block_size = head.block_array_len.checked_add(SIGNING_BLOCK_HEAD_LEN as i64);
    let block_size = match block_size {
        Some(size) if (SIGNING_BLOCK_HEAD_LEN as i64..=MAX_SIGNING_BLOCK_SIZE).contains(&size) => {
            size
        }
        _ => {
            error!("Signing block array length {} out of range", head.block_array_len);
            return Err(Error::BlockTooLarge(head.block_array_len));
        }
    };
    if !(0..=MAX_BLOCK_COUNT).contains(&head.block_count) {
        error!("Signing block declares {} sub-blocks", head.block_count);
        return Err(Error::TooManyBlocks(head.block_count));
    }
    if (central_dir_offset as i64) < block_size {
        error!("Signing block of {block_size} bytes would start before the package");
        return Err(Error::SigningBlock("block starts before package".to_string()));
    }
    Ok(head)
}

fn split_sub_blocks(block_array: &[u8], block_count: i32) -> Result<(Vec<u8>, Vec<OptionalBlock>)> {
    let headers_len = block_count as usize * SUB_BLOCK_HEAD_LEN;
    if headers_len > block_array.len() {
        error!("{block_count} sub-block headers do not fit in {} bytes", block_array.len());
        return Err(Error::SigningBlock("sub-block headers overflow".to_string()));
    }

    let mut cursor = ByteCursor::new(block_array);
    let mut signature_block = None;
    let mut optional_blocks = vec![];
    let mut consumed = 0usize;

    for index in 0..block_count {
        let head: SubBlockHead = bincode::deserialize(cursor.read_bytes(SUB_BLOCK_HEAD_LEN)?)?;
        let offset = head.offset as usize;
        let length = head.length as usize;
        if offset < headers_len {
            error!("Sub-block {index} payload at {offset} overlaps the header table");
            return Err(Error::SigningBlock(format!("sub-block {index} overlaps headers")));
        }
        let value = match cursor.bytes_at(offset, length) {
            Ok(value) => value.to_vec(),
            Err(e) => {
                error!("Sub-block {index} of {length} bytes at {offset} leaves the block array: {e:?}");
                return Err(e);
            }
        };
        consumed += SUB_BLOCK_HEAD_LEN + length;

        if head.block_type == SIGNATURE_BLOCK_TYPE {
            if signature_block.is_some() {
                error!("Duplicate signature sub-block at index {index}");
                return Err(Error::SigningBlock("duplicate signature sub-block".to_string()));
            }
            signature_block = Some(value);
        } else if let Some(block_type) = OptionalBlockType::from_type_id(head.block_type) {
            optional_blocks.push(OptionalBlock { block_type, value });
        } else {
            warn!("Ignoring sub-block {index} of unknown type {:#x}", head.block_type);
        }
    }

    if consumed != block_array.len() {
        error!(
            "Sub-blocks account for {consumed} bytes but the block array holds {}",
            block_array.len()
        );
        return Err(Error::SigningBlock("block array length mismatch".to_string()));
    }

    match signature_block {
        Some(block) if !block.is_empty() => Ok((block, optional_blocks)),
        _ => {
            error!("Signing block has no signature sub-block");
            Err(Error::SigningBlock("no signature sub-block".to_string()))
        }
    }
}
