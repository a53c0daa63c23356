//! Two-level chunked content digest over the signed regions of a package.
//!
//! Each region (zip entries, central directory, end of central directory) is split into chunks of
//! at most [`CHUNK_SIZE`] bytes. Every chunk is hashed as `0xa5 || le32(len) || chunk`, then the
//! final digest is `0x5a || le32(chunk_count) || chunk digests... || optional sub-blocks...`.

use const_oid::db::rfc5912::{ID_SHA_256, ID_SHA_384, ID_SHA_512};
use const_oid::ObjectIdentifier;
use log::error;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::cursor::ByteCursor;
use crate::signing_block::{OptionalBlock, SignatureInfo, ZIP_CD_OFFSET_IN_EOCD};
use crate::source::{BufferSource, ContentSource, PackageData, RegionSource};
use crate::{Error, Result};

pub const CHUNK_SIZE: usize = 1024 * 1024;
const FIRST_LEVEL_CHUNK_PREFIX: u8 = 0x5a;
const SECOND_LEVEL_CHUNK_PREFIX: u8 = 0xa5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_oid(oid: &ObjectIdentifier) -> Result<Self> {
        if *oid == ID_SHA_256 {
            Ok(DigestAlgorithm::Sha256)
        } else if *oid == ID_SHA_384 {
            Ok(DigestAlgorithm::Sha384)
        } else if *oid == ID_SHA_512 {
            Ok(DigestAlgorithm::Sha512)
        } else {
            Err(Error::UnsupportedAlgorithm(format!("digest {oid}")))
        }
    }

    /// Maps the signature algorithm id recorded in the signed content to its digest.
    pub fn from_algorithm_id(algorithm_id: i32) -> Result<Self> {
        match algorithm_id {
            0x101 | 0x104 | 0x201 => Ok(DigestAlgorithm::Sha256),
            0x102 | 0x105 | 0x202 => Ok(DigestAlgorithm::Sha384),
            0x103 | 0x106 | 0x203 => Ok(DigestAlgorithm::Sha512),
            _ => Err(Error::UnsupportedAlgorithm(format!(
                "content algorithm id {algorithm_id:#x}"
            ))),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A running hash of a fixed algorithm, reused across chunks.
pub struct DigestParameter {
    context: Box<dyn sha2::digest::DynDigest + Send>,
}

impl DigestParameter {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let context: Box<dyn sha2::digest::DynDigest + Send> = match algorithm {
            DigestAlgorithm::Sha256 => Box::new(Sha256::new()),
            DigestAlgorithm::Sha384 => Box::new(Sha384::new()),
            DigestAlgorithm::Sha512 => Box::new(Sha512::new()),
        };
        DigestParameter { context }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.update(data);
    }

    pub fn finalize_reset(&mut self) -> Vec<u8> {
        self.context.finalize_reset().to_vec()
    }
}

/// Computes the two-level digest of `sources` followed by `optional_blocks`.
pub fn compute_digest(
    sources: &mut [&mut dyn ContentSource],
    algorithm: DigestAlgorithm,
    optional_blocks: &[OptionalBlock],
) -> Result<Vec<u8>> {
    let chunk_count = chunk_count(sources, algorithm)?;

    let mut chunk_digests = Vec::with_capacity(chunk_count as usize * algorithm.output_len());
    let mut param = DigestParameter::new(algorithm);
    for source in sources.iter_mut() {
        while source.has_remaining() {
            let chunk_len = source.remaining().min(CHUNK_SIZE as u64) as usize;
            param.update(&[SECOND_LEVEL_CHUNK_PREFIX]);
            param.update(&(chunk_len as i32).to_le_bytes());
            source.read_and_digest(&mut param, chunk_len)?;
            chunk_digests.extend(param.finalize_reset());
        }
    }

    param.update(&[FIRST_LEVEL_CHUNK_PREFIX]);
    param.update(&chunk_count.to_le_bytes());
    param.update(&chunk_digests);
    for block in optional_blocks {
        param.update(&block.value);
    }
    Ok(param.finalize_reset())
}

fn chunk_count(sources: &[&mut dyn ContentSource], algorithm: DigestAlgorithm) -> Result<i32> {
    let mut total = 0u64;
    for source in sources {
        total = total
            .checked_add(source.remaining().div_ceil(CHUNK_SIZE as u64))
            .ok_or(Error::TooManyChunks)?;
    }
    let total = match i32::try_from(total) {
        Ok(total) => total,
        Err(_) => {
            error!("{total} chunks do not fit in a 32-bit count");
            return Err(Error::TooManyChunks);
        }
    };
    if total.checked_mul(algorithm.output_len() as i32).is_none() {
        error!("{total} chunk digests would overflow the digest buffer");
        return Err(Error::TooManyChunks);
    }
    Ok(total)
}

/// The digest recorded in the signed content of the app PKCS#7 block.
///
/// ```text
/// i4 version, i4 block_count,
/// i4 block_length = 8 + digest_length, i4 algorithm_id, i4 digest_length, digest bytes...
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDigest {
    pub algorithm_id: i32,
    pub algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
}

const DIGEST_BLOCK_LEN_OFFSET: usize = 8;
const DIGEST_ALGORITHM_OFFSET: usize = 12;
const DIGEST_LEN_OFFSET: usize = 16;
const DIGEST_OFFSET: usize = 20;

pub fn parse_content_digest(content: &[u8]) -> Result<ContentDigest> {
    let cursor = ByteCursor::new(content);
    let block_len = cursor.i32_at(DIGEST_BLOCK_LEN_OFFSET)?;
    let algorithm_id = cursor.i32_at(DIGEST_ALGORITHM_OFFSET)?;
    let digest_len = cursor.i32_at(DIGEST_LEN_OFFSET)?;

    if digest_len <= 0 {
        return Err(Error::DigestHeader(format!("digest length {digest_len}")));
    }
    let expected_block_len = digest_len.checked_add(8);
    if expected_block_len != Some(block_len) {
        return Err(Error::DigestHeader(format!(
            "block length {block_len} does not cover digest length {digest_len}"
        )));
    }
    let algorithm = DigestAlgorithm::from_algorithm_id(algorithm_id)?;
    let digest = cursor.bytes_at(DIGEST_OFFSET, digest_len as usize)?.to_vec();

    Ok(ContentDigest {
        algorithm_id,
        algorithm,
        digest,
    })
}

/// Recomputes the package digest and compares it with the signed one.
pub fn verify_integrity<P: PackageData + ?Sized>(
    package: &P,
    info: &SignatureInfo,
    expected: &ContentDigest,
) -> Result<()> {
    let mut entries = RegionSource::new(package, 0, info.signing_block_offset);
    let mut central_dir = RegionSource::new(
        package,
        info.central_dir_offset,
        info.eocd_offset - info.central_dir_offset,
    );
    let eocd = unsigned_eocd(info)?;
    let mut eocd_source = BufferSource::new(&eocd);

    let mut sources: [&mut dyn ContentSource; 3] =
        [&mut entries, &mut central_dir, &mut eocd_source];
    let actual = compute_digest(&mut sources, expected.algorithm, &info.optional_blocks)?;
    if actual != expected.digest {
        error!(
            "Package digest {} does not match signed digest {}",
            hex::encode(&actual),
            hex::encode(&expected.digest)
        );
        return Err(Error::DigestMismatch);
    }
    Ok(())
}

/// The EOCD as it was before the signing block was inserted, i.e. with the central directory
/// offset pointing at the signing block.
fn unsigned_eocd(info: &SignatureInfo) -> Result<Vec<u8>> {
    let mut eocd = info.eocd.clone();
    let offset = u32::try_from(info.signing_block_offset)
        .map_err(|_| Error::CentralDirectory("signing block offset exceeds 32 bits".to_string()))?;
    let field = eocd
        .get_mut(ZIP_CD_OFFSET_IN_EOCD..ZIP_CD_OFFSET_IN_EOCD + 4)
        .ok_or_else(|| Error::Eocd("record too short".to_string()))?;
    field.copy_from_slice(&offset.to_le_bytes());
    Ok(eocd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing_block::{locate, OptionalBlockType, PROFILE_BLOCK_TYPE};
    use crate::testutil::{eocd, PackageBuilder};

    fn reference_digest(regions: &[&[u8]], optional: &[&[u8]]) -> Vec<u8> {
        let mut chunk_digests = vec![];
        let mut count = 0i32;
        for region in regions {
            for chunk in region.chunks(CHUNK_SIZE) {
                let mut hasher = Sha256::new();
                hasher.update([0xa5]);
                hasher.update((chunk.len() as i32).to_le_bytes());
                hasher.update(chunk);
                chunk_digests.extend(hasher.finalize());
                count += 1;
            }
        }
        let mut hasher = Sha256::new();
        hasher.update([0x5a]);
        hasher.update(count.to_le_bytes());
        hasher.update(&chunk_digests);
        for block in optional {
            hasher.update(block);
        }
        hasher.finalize().to_vec()
    }

    #[test]
    fn matches_reference_across_chunk_boundaries() {
        let big: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 253) as u8).collect();
        let cd = vec![0x11u8; CHUNK_SIZE];
        let tail = vec![0x22u8; 22];
        let blocks = vec![OptionalBlock {
            block_type: OptionalBlockType::Profile,
            value: b"profile".to_vec(),
        }];

        let mut s1 = BufferSource::new(&big);
        let mut s2 = BufferSource::new(&cd);
        let mut s3 = BufferSource::new(&tail);
        let mut sources: [&mut dyn ContentSource; 3] = [&mut s1, &mut s2, &mut s3];
        let digest = compute_digest(&mut sources, DigestAlgorithm::Sha256, &blocks).unwrap();

        assert_eq!(reference_digest(&[&big, &cd, &tail], &[b"profile"]), digest);
    }

    #[test]
    fn digest_is_deterministic_and_byte_sensitive() {
        let mut regions = vec![vec![1u8; 1000], vec![2u8; 300], vec![3u8; 22]];
        let run = |regions: &Vec<Vec<u8>>| {
            let mut a = BufferSource::new(&regions[0]);
            let mut b = BufferSource::new(&regions[1]);
            let mut c = BufferSource::new(&regions[2]);
            let mut sources: [&mut dyn ContentSource; 3] = [&mut a, &mut b, &mut c];
            compute_digest(&mut sources, DigestAlgorithm::Sha384, &[]).unwrap()
        };
        let first = run(&regions);
        assert_eq!(first, run(&regions));
        assert_eq!(48, first.len());

        for index in 0..3 {
            regions[index][5] ^= 0x80;
            assert_ne!(first, run(&regions), "flip in region {index}");
            regions[index][5] ^= 0x80;
        }
    }

    #[test]
    fn empty_sources_contribute_no_chunks() {
        let mut a = BufferSource::new(&[]);
        let mut sources: [&mut dyn ContentSource; 1] = [&mut a];
        let digest = compute_digest(&mut sources, DigestAlgorithm::Sha256, &[]).unwrap();
        assert_eq!(reference_digest(&[], &[]), digest);
    }

    /// Claims `remaining` bytes but must never be read.
    struct HugeSource {
        remaining: u64,
    }

    impl ContentSource for HugeSource {
        fn has_remaining(&self) -> bool {
            self.remaining > 0
        }

        fn remaining(&self) -> u64 {
            self.remaining
        }

        fn reset(&mut self) {}

        fn read_and_digest(&mut self, _: &mut DigestParameter, _: usize) -> Result<()> {
            panic!("chunk bounds must be checked before reading");
        }
    }

    #[test]
    fn oversized_sources_are_rejected_before_reading() {
        let chunk = CHUNK_SIZE as u64;
        for remaining in [
            (i32::MAX as u64 + 1) * chunk,
            (i32::MAX as u64 / 32 + 1) * chunk,
        ] {
            let mut source = HugeSource { remaining };
            let mut sources: [&mut dyn ContentSource; 1] = [&mut source];
            assert!(matches!(
                compute_digest(&mut sources, DigestAlgorithm::Sha256, &[]),
                Err(Error::TooManyChunks)
            ));
        }
    }

    #[test]
    fn parses_content_digest_header() {
        let mut content = vec![];
        content.extend(1i32.to_le_bytes());
        content.extend(1i32.to_le_bytes());
        content.extend(40i32.to_le_bytes());
        content.extend(0x104i32.to_le_bytes());
        content.extend(32i32.to_le_bytes());
        content.extend([0xab; 32]);

        let parsed = parse_content_digest(&content).unwrap();
        assert_eq!(DigestAlgorithm::Sha256, parsed.algorithm);
        assert_eq!(vec![0xab; 32], parsed.digest);

        let mut bad_len = content.clone();
        bad_len[8] = 41;
        assert!(matches!(
            parse_content_digest(&bad_len),
            Err(Error::DigestHeader(_))
        ));

        let mut bad_algorithm = content.clone();
        bad_algorithm[12] = 0x07;
        assert!(parse_content_digest(&bad_algorithm).is_err());

        assert!(parse_content_digest(&content[..40]).is_err());
        assert!(parse_content_digest(&content[..10]).is_err());
    }

    #[test]
    fn integrity_covers_all_regions() {
        let package = PackageBuilder::new()
            .signature(vec![0x30; 64])
            .optional(PROFILE_BLOCK_TYPE, b"profile".to_vec())
            .build();
        let info = locate(package.bytes.as_slice()).unwrap();

        let unsigned_eocd = eocd(
            package.central_dir().len() as u32,
            package.signing_block_offset as u32,
            &[],
        );
        let expected = ContentDigest {
            algorithm_id: 0x104,
            algorithm: DigestAlgorithm::Sha256,
            digest: reference_digest(
                &[package.entries(), package.central_dir(), &unsigned_eocd],
                &[b"profile"],
            ),
        };
        verify_integrity(package.bytes.as_slice(), &info, &expected).unwrap();

        let mut tampered = package.bytes.clone();
        tampered[package.central_dir_offset as usize + 10] ^= 1;
        let info = locate(tampered.as_slice()).unwrap();
        assert!(matches!(
            verify_integrity(tampered.as_slice(), &info, &expected),
            Err(Error::DigestMismatch)
        ));

        let mut tampered = package.bytes.clone();
        tampered[3] ^= 1;
        let info = locate(tampered.as_slice()).unwrap();
        assert!(verify_integrity(tampered.as_slice(), &info, &expected).is_err());
    }
}
