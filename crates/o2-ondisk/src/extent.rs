#![forbid(unsafe_code)]

use o2_types::{
    ParseError, ensure_slice, read_le_u16, read_le_u32, read_le_u64, read_u8, write_bytes,
    write_le_u16, write_le_u32, write_le_u64, write_u8,
};

pub const EXTENT_BLOCK_SIGNATURE: &[u8] = b"EXBLK01";

/// Size of the extent list header that precedes the records.
pub const EXTENT_LIST_HEADER_LEN: usize = 0x10;
pub const EXTENT_REC_LEN: usize = 16;

/// Offset of the embedded extent list inside an extent block.
pub const EXTENT_BLOCK_LIST_OFFSET: usize = 0x40;

/// Upper bound on tree depth accepted while walking.
pub const MAX_EXTENT_DEPTH: u16 = 4;

/// Extent is allocated but not yet written.
pub const EXTENT_FLAG_UNWRITTEN: u8 = 0x01;
/// Extent shares clusters through a refcount tree.
pub const EXTENT_FLAG_REFCOUNTED: u8 = 0x02;

/// One extent record.
///
/// `clusters` holds `e_leaf_clusters` for leaf lists and `e_int_clusters`
/// for interior lists; the on-disk width differs and the owning list's depth
/// decides which one is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRec {
    pub cpos: u32,
    pub clusters: u32,
    pub flags: u8,
    pub blkno: u64,
}

impl ExtentRec {
    /// First logical cluster past this record.
    #[must_use]
    pub fn end_cpos(&self) -> u64 {
        u64::from(self.cpos) + u64::from(self.clusters)
    }

    #[must_use]
    pub fn contains(&self, cpos: u32) -> bool {
        cpos >= self.cpos && u64::from(cpos) < self.end_cpos()
    }

    #[must_use]
    pub fn is_unwritten(&self) -> bool {
        self.flags & EXTENT_FLAG_UNWRITTEN != 0
    }
}

/// Extent list as stored in an inode's payload or an extent block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentList {
    pub tree_depth: u16,
    /// Record capacity (`l_count`).
    pub count: u16,
    /// Records in use; `recs.len() == next_free_rec`.
    pub recs: Vec<ExtentRec>,
}

impl ExtentList {
    /// Empty depth-0 list with the given capacity.
    #[must_use]
    pub fn empty(count: u16) -> Self {
        Self {
            tree_depth: 0,
            count,
            recs: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.tree_depth == 0
    }

    #[must_use]
    pub fn next_free_rec(&self) -> usize {
        self.recs.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.recs.len() >= usize::from(self.count)
    }

    /// Total clusters covered by this list's records.
    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.recs.iter().map(|rec| u64::from(rec.clusters)).sum()
    }

    /// Parse an extent list starting at `offset` in `data`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let tree_depth = read_le_u16(data, offset)?;
        let count = read_le_u16(data, offset + 2)?;
        let next_free = read_le_u16(data, offset + 4)?;
        if next_free > count {
            return Err(ParseError::InvalidField {
                field: "l_next_free_rec",
                reason: "exceeds l_count",
            });
        }
        let recs_start = offset + EXTENT_LIST_HEADER_LEN;
        ensure_slice(data, recs_start, usize::from(next_free) * EXTENT_REC_LEN)?;

        let mut recs = Vec::with_capacity(usize::from(next_free));
        for i in 0..usize::from(next_free) {
            let at = recs_start + i * EXTENT_REC_LEN;
            let cpos = read_le_u32(data, at)?;
            let (clusters, flags) = if tree_depth == 0 {
                (u32::from(read_le_u16(data, at + 4)?), read_u8(data, at + 7)?)
            } else {
                (read_le_u32(data, at + 4)?, 0)
            };
            recs.push(ExtentRec {
                cpos,
                clusters,
                flags,
                blkno: read_le_u64(data, at + 8)?,
            });
        }
        Ok(Self {
            tree_depth,
            count,
            recs,
        })
    }

    /// Encode this list at `offset`, zeroing unused record slots.
    pub fn encode_into(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        if self.recs.len() > usize::from(self.count) {
            return Err(ParseError::InvalidField {
                field: "l_next_free_rec",
                reason: "exceeds l_count",
            });
        }
        let next_free = u16::try_from(self.recs.len()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "l_next_free_rec",
            }
        })?;
        write_le_u16(data, offset, self.tree_depth)?;
        write_le_u16(data, offset + 2, self.count)?;
        write_le_u16(data, offset + 4, next_free)?;
        write_le_u16(data, offset + 6, 0)?;
        write_le_u64(data, offset + 8, 0)?;

        let recs_start = offset + EXTENT_LIST_HEADER_LEN;
        for (i, rec) in self.recs.iter().enumerate() {
            let at = recs_start + i * EXTENT_REC_LEN;
            write_le_u32(data, at, rec.cpos)?;
            if self.tree_depth == 0 {
                let leaf = u16::try_from(rec.clusters).map_err(|_| {
                    ParseError::IntegerConversion {
                        field: "e_leaf_clusters",
                    }
                })?;
                write_le_u16(data, at + 4, leaf)?;
                write_u8(data, at + 6, 0)?;
                write_u8(data, at + 7, rec.flags)?;
            } else {
                write_le_u32(data, at + 4, rec.clusters)?;
            }
            write_le_u64(data, at + 8, rec.blkno)?;
        }
        let unused = usize::from(self.count) - self.recs.len();
        let tail_start = recs_start + self.recs.len() * EXTENT_REC_LEN;
        let tail_len = (unused * EXTENT_REC_LEN).min(data.len().saturating_sub(tail_start));
        write_bytes(data, tail_start, &vec![0_u8; tail_len])?;
        Ok(())
    }
}

/// Out-of-inode continuation of an extent tree (`EXBLK01`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentBlock {
    pub suballoc_slot: u16,
    pub suballoc_bit: u16,
    pub fs_generation: u32,
    pub blkno: u64,
    pub suballoc_loc: u64,
    pub next_leaf_blk: u64,
    pub list: ExtentList,
}

impl ExtentBlock {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let sig = ensure_slice(data, 0, EXTENT_BLOCK_SIGNATURE.len())?;
        if sig != EXTENT_BLOCK_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: String::from_utf8_lossy(EXTENT_BLOCK_SIGNATURE).into_owned(),
                actual: String::from_utf8_lossy(sig).into_owned(),
            });
        }
        Ok(Self {
            suballoc_slot: read_le_u16(data, 0x10)?,
            suballoc_bit: read_le_u16(data, 0x12)?,
            fs_generation: read_le_u32(data, 0x14)?,
            blkno: read_le_u64(data, 0x18)?,
            suballoc_loc: read_le_u64(data, 0x20)?,
            next_leaf_blk: read_le_u64(data, 0x28)?,
            list: ExtentList::parse(data, EXTENT_BLOCK_LIST_OFFSET)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        let mut sig = [0_u8; 8];
        sig[..EXTENT_BLOCK_SIGNATURE.len()].copy_from_slice(EXTENT_BLOCK_SIGNATURE);
        write_bytes(data, 0, &sig)?;
        write_le_u16(data, 0x10, self.suballoc_slot)?;
        write_le_u16(data, 0x12, self.suballoc_bit)?;
        write_le_u32(data, 0x14, self.fs_generation)?;
        write_le_u64(data, 0x18, self.blkno)?;
        write_le_u64(data, 0x20, self.suballoc_loc)?;
        write_le_u64(data, 0x28, self.next_leaf_blk)?;
        self.list.encode_into(data, EXTENT_BLOCK_LIST_OFFSET)
    }
}

/// Record capacity of an extent list embedded in an inode.
#[must_use]
pub fn extent_recs_per_inode(block_size: usize) -> u16 {
    let recs = block_size.saturating_sub(crate::inode::DINODE_ID2_OFFSET + EXTENT_LIST_HEADER_LEN)
        / EXTENT_REC_LEN;
    u16::try_from(recs).unwrap_or(u16::MAX)
}

/// Record capacity of an extent list inside an extent block.
#[must_use]
pub fn extent_recs_per_block(block_size: usize) -> u16 {
    let recs = block_size.saturating_sub(EXTENT_BLOCK_LIST_OFFSET + EXTENT_LIST_HEADER_LEN)
        / EXTENT_REC_LEN;
    u16::try_from(recs).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(recs: &[(u32, u32, u64)]) -> ExtentList {
        ExtentList {
            tree_depth: 0,
            count: 4,
            recs: recs
                .iter()
                .map(|&(cpos, clusters, blkno)| ExtentRec {
                    cpos,
                    clusters,
                    flags: 0,
                    blkno,
                })
                .collect(),
        }
    }

    #[test]
    fn leaf_and_interior_use_different_cluster_widths() {
        let mut buf = vec![0_u8; 128];
        let list = leaf(&[(0, 3, 100)]);
        list.encode_into(&mut buf, 0).expect("encode");
        // e_leaf_clusters is a u16 followed by reserved and flags bytes.
        assert_eq!(&buf[0x14..0x18], &[3, 0, 0, 0]);

        let interior = ExtentList {
            tree_depth: 1,
            count: 4,
            recs: vec![ExtentRec {
                cpos: 0,
                clusters: 0x0001_0000,
                flags: 0,
                blkno: 7,
            }],
        };
        interior.encode_into(&mut buf, 0).expect("encode");
        assert_eq!(read_le_u32(&buf, 0x14), Ok(0x0001_0000));
        let parsed = ExtentList::parse(&buf, 0).expect("parse");
        assert_eq!(parsed, interior);
    }

    #[test]
    fn leaf_cluster_count_must_fit_u16() {
        let mut buf = vec![0_u8; 128];
        let list = leaf(&[(0, 0x1_0000, 100)]);
        assert_eq!(
            list.encode_into(&mut buf, 0),
            Err(ParseError::IntegerConversion {
                field: "e_leaf_clusters"
            })
        );
    }

    #[test]
    fn next_free_beyond_count_is_rejected() {
        let mut buf = vec![0_u8; 64];
        write_le_u16(&mut buf, 2, 1).expect("count");
        write_le_u16(&mut buf, 4, 2).expect("next free");
        assert!(matches!(
            ExtentList::parse(&buf, 0),
            Err(ParseError::InvalidField {
                field: "l_next_free_rec",
                ..
            })
        ));
    }

    #[test]
    fn encode_zeroes_stale_slots() {
        let mut buf = vec![0xAA_u8; 0x10 + 4 * 16];
        leaf(&[(0, 1, 9)]).encode_into(&mut buf, 0).expect("encode");
        assert!(buf[0x20..].iter().all(|b| *b == 0));
    }

    #[test]
    fn extent_block_requires_signature() {
        let mut buf = vec![0_u8; 512];
        assert!(matches!(
            ExtentBlock::parse(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
        let eb = ExtentBlock {
            suballoc_slot: 0,
            suballoc_bit: 3,
            fs_generation: 0xfeed,
            blkno: 40,
            suballoc_loc: 0,
            next_leaf_blk: 0,
            list: ExtentList {
                tree_depth: 0,
                count: extent_recs_per_block(512),
                recs: vec![ExtentRec {
                    cpos: 0,
                    clusters: 2,
                    flags: EXTENT_FLAG_UNWRITTEN,
                    blkno: 64,
                }],
            },
        };
        eb.encode_into(&mut buf).expect("encode");
        let parsed = ExtentBlock::parse(&buf).expect("parse");
        assert_eq!(parsed, eb);
        assert!(parsed.list.recs[0].is_unwritten());
    }

    #[test]
    fn capacities_match_layout() {
        assert_eq!(extent_recs_per_inode(4096), 243);
        assert_eq!(extent_recs_per_block(4096), 251);
        assert_eq!(extent_recs_per_inode(512), 19);
    }

    #[test]
    fn rec_contains_is_half_open() {
        let rec = ExtentRec {
            cpos: 10,
            clusters: 5,
            flags: 0,
            blkno: 0,
        };
        assert!(!rec.contains(9));
        assert!(rec.contains(10));
        assert!(rec.contains(14));
        assert!(!rec.contains(15));
    }
}
