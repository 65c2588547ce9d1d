#![forbid(unsafe_code)]
//! Chain allocator inode payload and group descriptor blocks.

use o2_types::{
    ParseError, ensure_slice, read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_u16,
    write_le_u32, write_le_u64,
};

pub const GROUP_DESC_SIGNATURE: &[u8] = b"GROUP01";

pub const CHAIN_LIST_HEADER_LEN: usize = 0x10;
pub const CHAIN_REC_LEN: usize = 16;
/// Start of the bitmap inside a group descriptor block.
pub const GROUP_BITMAP_OFFSET: usize = 0x40;

/// One chain: a singly-linked list of groups, with cached totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRec {
    pub free: u32,
    pub total: u32,
    /// First group descriptor in the chain.
    pub blkno: u64,
}

/// `id2.i_chain` of an allocator inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainList {
    /// Clusters per group.
    pub cpg: u16,
    /// Bits per cluster.
    pub bpc: u16,
    pub count: u16,
    pub recs: Vec<ChainRec>,
}

impl ChainList {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let cpg = read_le_u16(data, offset)?;
        let bpc = read_le_u16(data, offset + 2)?;
        let count = read_le_u16(data, offset + 4)?;
        let next_free = read_le_u16(data, offset + 6)?;
        if next_free > count {
            return Err(ParseError::InvalidField {
                field: "cl_next_free_rec",
                reason: "exceeds cl_count",
            });
        }
        let recs_start = offset + CHAIN_LIST_HEADER_LEN;
        ensure_slice(data, recs_start, usize::from(next_free) * CHAIN_REC_LEN)?;
        let recs = (0..usize::from(next_free))
            .map(|i| {
                let at = recs_start + i * CHAIN_REC_LEN;
                Ok(ChainRec {
                    free: read_le_u32(data, at)?,
                    total: read_le_u32(data, at + 4)?,
                    blkno: read_le_u64(data, at + 8)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            cpg,
            bpc,
            count,
            recs,
        })
    }

    pub fn encode_into(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let next_free = u16::try_from(self.recs.len())
            .ok()
            .filter(|n| *n <= self.count)
            .ok_or(ParseError::InvalidField {
                field: "cl_next_free_rec",
                reason: "exceeds cl_count",
            })?;
        write_le_u16(data, offset, self.cpg)?;
        write_le_u16(data, offset + 2, self.bpc)?;
        write_le_u16(data, offset + 4, self.count)?;
        write_le_u16(data, offset + 6, next_free)?;
        write_le_u64(data, offset + 8, 0)?;
        let recs_start = offset + CHAIN_LIST_HEADER_LEN;
        for (i, rec) in self.recs.iter().enumerate() {
            let at = recs_start + i * CHAIN_REC_LEN;
            write_le_u32(data, at, rec.free)?;
            write_le_u32(data, at + 4, rec.total)?;
            write_le_u64(data, at + 8, rec.blkno)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.recs.iter().map(|r| u64::from(r.free)).sum()
    }

    #[must_use]
    pub fn total_bits(&self) -> u64 {
        self.recs.iter().map(|r| u64::from(r.total)).sum()
    }
}

/// Allocation group descriptor (`GROUP01`) with its bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDesc {
    /// Bitmap size in bytes.
    pub size: u16,
    /// Number of valid bits.
    pub bits: u16,
    pub free_bits_count: u16,
    /// Index of the chain this group hangs off.
    pub chain: u16,
    pub generation: u32,
    pub next_group: u64,
    pub parent_dinode: u64,
    pub blkno: u64,
    pub bitmap: Vec<u8>,
}

impl GroupDesc {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let sig = ensure_slice(data, 0, GROUP_DESC_SIGNATURE.len())?;
        if sig != GROUP_DESC_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: String::from_utf8_lossy(GROUP_DESC_SIGNATURE).into_owned(),
                actual: String::from_utf8_lossy(sig).into_owned(),
            });
        }
        let size = read_le_u16(data, 0x08)?;
        let bits = read_le_u16(data, 0x0A)?;
        if usize::from(bits) > usize::from(size) * 8 {
            return Err(ParseError::InvalidField {
                field: "bg_bits",
                reason: "exceeds bitmap size",
            });
        }
        let bitmap = ensure_slice(data, GROUP_BITMAP_OFFSET, usize::from(size))?.to_vec();
        Ok(Self {
            size,
            bits,
            free_bits_count: read_le_u16(data, 0x0C)?,
            chain: read_le_u16(data, 0x0E)?,
            generation: read_le_u32(data, 0x10)?,
            next_group: read_le_u64(data, 0x18)?,
            parent_dinode: read_le_u64(data, 0x20)?,
            blkno: read_le_u64(data, 0x28)?,
            bitmap,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        if self.bitmap.len() != usize::from(self.size) {
            return Err(ParseError::InvalidField {
                field: "bg_size",
                reason: "bitmap length mismatch",
            });
        }
        let mut sig = [0_u8; 8];
        sig[..GROUP_DESC_SIGNATURE.len()].copy_from_slice(GROUP_DESC_SIGNATURE);
        write_bytes(data, 0, &sig)?;
        write_le_u16(data, 0x08, self.size)?;
        write_le_u16(data, 0x0A, self.bits)?;
        write_le_u16(data, 0x0C, self.free_bits_count)?;
        write_le_u16(data, 0x0E, self.chain)?;
        write_le_u32(data, 0x10, self.generation)?;
        write_le_u64(data, 0x18, self.next_group)?;
        write_le_u64(data, 0x20, self.parent_dinode)?;
        write_le_u64(data, 0x28, self.blkno)?;
        write_bytes(data, GROUP_BITMAP_OFFSET, &self.bitmap)
    }
}

/// Bitmap bytes available in a group descriptor block.
#[must_use]
pub fn group_bitmap_size(block_size: usize) -> u16 {
    u16::try_from(block_size.saturating_sub(GROUP_BITMAP_OFFSET)).unwrap_or(u16::MAX)
}

/// Chain record capacity of an allocator inode.
#[must_use]
pub fn chain_recs_per_inode(block_size: usize) -> u16 {
    let recs = block_size
        .saturating_sub(crate::inode::DINODE_ID2_OFFSET + CHAIN_LIST_HEADER_LEN)
        / CHAIN_REC_LEN;
    u16::try_from(recs).unwrap_or(u16::MAX)
}
