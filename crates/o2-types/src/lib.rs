#![forbid(unsafe_code)]
//! Shared newtypes and byte-level helpers.
//!
//! Everything here is pure: no I/O, no allocation beyond what the caller
//! asks for. Volume structures are little-endian; the journal is big-endian,
//! so both families of helpers live side by side.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Block number of the primary superblock.
pub const SUPERBLOCK_BLKNO: u64 = 2;

/// Maximum length of a directory entry name.
pub const MAX_FILENAME_LEN: usize = 255;

/// Block sizes tried when opening a volume without a known block size.
pub const PROBE_BLOCK_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNumber(pub u64);

/// Node slot index inside a shared volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotNumber(pub u16);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for the given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: u32) -> Option<u64> {
        self.0.checked_mul(u64::from(block_size))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid signature: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: String, actual: String },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Volume geometry ─────────────────────────────────────────────────────────

/// Validated block/cluster geometry of an open volume.
///
/// Invariant: block size is a power of two in 512..=4096, cluster size is a
/// power of two in 4K..=1M, and cluster size ≥ block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    blocksize_bits: u32,
    clustersize_bits: u32,
    block_count: u64,
}

impl Geometry {
    pub const MIN_BLOCKSIZE_BITS: u32 = 9;
    pub const MAX_BLOCKSIZE_BITS: u32 = 12;
    pub const MIN_CLUSTERSIZE_BITS: u32 = 12;
    pub const MAX_CLUSTERSIZE_BITS: u32 = 20;

    pub fn new(
        blocksize_bits: u32,
        clustersize_bits: u32,
        block_count: u64,
    ) -> Result<Self, ParseError> {
        if !(Self::MIN_BLOCKSIZE_BITS..=Self::MAX_BLOCKSIZE_BITS).contains(&blocksize_bits) {
            return Err(ParseError::InvalidField {
                field: "s_blocksize_bits",
                reason: "block size must be 512..=4096",
            });
        }
        if !(Self::MIN_CLUSTERSIZE_BITS..=Self::MAX_CLUSTERSIZE_BITS).contains(&clustersize_bits)
        {
            return Err(ParseError::InvalidField {
                field: "s_clustersize_bits",
                reason: "cluster size must be 4K..=1M",
            });
        }
        if clustersize_bits < blocksize_bits {
            return Err(ParseError::InvalidField {
                field: "s_clustersize_bits",
                reason: "cluster size smaller than block size",
            });
        }
        Ok(Self {
            blocksize_bits,
            clustersize_bits,
            block_count,
        })
    }

    #[must_use]
    pub fn blocksize_bits(self) -> u32 {
        self.blocksize_bits
    }

    #[must_use]
    pub fn clustersize_bits(self) -> u32 {
        self.clustersize_bits
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        1_u32 << self.blocksize_bits
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn block_len(self) -> usize {
        1_usize << self.blocksize_bits
    }

    #[must_use]
    pub fn cluster_size(self) -> u32 {
        1_u32 << self.clustersize_bits
    }

    /// log2(blocks per cluster).
    #[must_use]
    pub fn cluster_shift(self) -> u32 {
        self.clustersize_bits - self.blocksize_bits
    }

    #[must_use]
    pub fn blocks_per_cluster(self) -> u32 {
        1_u32 << self.cluster_shift()
    }

    #[must_use]
    pub fn block_count(self) -> u64 {
        self.block_count
    }

    /// Whole clusters on the volume.
    #[must_use]
    pub fn cluster_count(self) -> u64 {
        self.block_count >> self.cluster_shift()
    }

    #[must_use]
    pub fn clusters_to_blocks(self, clusters: u64) -> u64 {
        clusters << self.cluster_shift()
    }

    /// Clusters needed to hold `blocks` blocks (rounded up).
    #[must_use]
    pub fn blocks_to_clusters(self, blocks: u64) -> u64 {
        let mask = u64::from(self.blocks_per_cluster()) - 1;
        (blocks + mask) >> self.cluster_shift()
    }

    #[must_use]
    pub fn cluster_to_block(self, cluster: ClusterNumber) -> BlockNumber {
        BlockNumber(self.clusters_to_blocks(cluster.0))
    }

    #[must_use]
    pub fn block_to_cluster(self, block: BlockNumber) -> ClusterNumber {
        ClusterNumber(block.0 >> self.cluster_shift())
    }

    /// True if `block` lies inside the volume.
    #[must_use]
    pub fn contains(self, block: BlockNumber) -> bool {
        block.0 < self.block_count
    }
}

// ── Field readers ───────────────────────────────────────────────────────────

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded byte field into a `String`, replacing invalid UTF-8.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

// ── Field writers ───────────────────────────────────────────────────────────

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
