#![forbid(unsafe_code)]
//! Block-type signature detection and per-type decode/encode dispatch.
//!
//! Detection walks [`SIGNATURE_TABLE`] in order and returns the first type
//! whose signature matches at its offset. Unknown blocks are never
//! interpreted: [`decode_block`] hands them back as raw bytes and
//! [`encode_block`] leaves the buffer untouched.

use crate::chain::{GROUP_DESC_SIGNATURE, GroupDesc};
use crate::dirent::{DIR_TRAILER_SIG_OFFSET, DirTrailer, dir_trailer_offset};
use crate::extent::{EXTENT_BLOCK_SIGNATURE, ExtentBlock};
use crate::inode::{Dinode, INODE_SIGNATURE, SUPER_BLOCK_SIGNATURE};
use o2_types::ParseError;
use serde::{Deserialize, Serialize};

pub const XATTR_BLOCK_SIGNATURE: &[u8] = b"XATTR01";
pub const REFCOUNT_BLOCK_SIGNATURE: &[u8] = b"REFCNT1";
pub const DX_ROOT_SIGNATURE: &[u8] = b"DXDIR01";
pub const DX_LEAF_SIGNATURE: &[u8] = b"DXLEAF1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Inode,
    Superblock,
    ExtentBlock,
    GroupDescriptor,
    DirBlock,
    Xattr,
    Refcount,
    DxRoot,
    DxLeaf,
    Unknown,
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inode => "inode",
            Self::Superblock => "superblock",
            Self::ExtentBlock => "extent block",
            Self::GroupDescriptor => "group descriptor",
            Self::DirBlock => "directory block",
            Self::Xattr => "xattr block",
            Self::Refcount => "refcount block",
            Self::DxRoot => "dx root",
            Self::DxLeaf => "dx leaf",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Where a signature lives in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOffset {
    /// Bytes from the start of the block.
    Start(usize),
    /// Bytes from the start of the 64-byte directory trailer.
    Trailer(usize),
}

impl SignatureOffset {
    #[must_use]
    pub fn resolve(self, block_size: usize) -> usize {
        match self {
            Self::Start(at) => at,
            Self::Trailer(at) => dir_trailer_offset(block_size) + at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureEntry {
    pub kind: BlockType,
    pub signature: &'static [u8],
    pub offset: SignatureOffset,
}

/// Detection order.
pub static SIGNATURE_TABLE: [SignatureEntry; 9] = [
    SignatureEntry {
        kind: BlockType::Inode,
        signature: INODE_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::Superblock,
        signature: SUPER_BLOCK_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::ExtentBlock,
        signature: EXTENT_BLOCK_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::GroupDescriptor,
        signature: GROUP_DESC_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::DirBlock,
        signature: crate::dirent::DIR_TRAILER_SIGNATURE,
        offset: SignatureOffset::Trailer(DIR_TRAILER_SIG_OFFSET),
    },
    SignatureEntry {
        kind: BlockType::Xattr,
        signature: XATTR_BLOCK_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::Refcount,
        signature: REFCOUNT_BLOCK_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::DxRoot,
        signature: DX_ROOT_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
    SignatureEntry {
        kind: BlockType::DxLeaf,
        signature: DX_LEAF_SIGNATURE,
        offset: SignatureOffset::Start(0),
    },
];

/// Identify a block by its signature. `data` must be the whole block.
#[must_use]
pub fn detect_block(data: &[u8]) -> BlockType {
    SIGNATURE_TABLE
        .iter()
        .find(|entry| {
            let at = entry.offset.resolve(data.len());
            data.get(at..at + entry.signature.len()) == Some(entry.signature)
        })
        .map_or(BlockType::Unknown, |entry| entry.kind)
}

/// A block decoded into its host-native structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedBlock {
    /// Inode or superblock.
    Inode(Box<Dinode>),
    ExtentBlock(ExtentBlock),
    GroupDescriptor(GroupDesc),
    DirTrailer(DirTrailer),
    /// Recognized type whose body this engine does not model.
    Raw { kind: BlockType, data: Vec<u8> },
    Unknown(Vec<u8>),
}

impl DecodedBlock {
    #[must_use]
    pub fn kind(&self) -> BlockType {
        match self {
            Self::Inode(inode) if inode.is_superblock() => BlockType::Superblock,
            Self::Inode(_) => BlockType::Inode,
            Self::ExtentBlock(_) => BlockType::ExtentBlock,
            Self::GroupDescriptor(_) => BlockType::GroupDescriptor,
            Self::DirTrailer(_) => BlockType::DirBlock,
            Self::Raw { kind, .. } => *kind,
            Self::Unknown(_) => BlockType::Unknown,
        }
    }
}

/// Detect and decode a block.
pub fn decode_block(data: &[u8]) -> Result<DecodedBlock, ParseError> {
    Ok(match detect_block(data) {
        BlockType::Inode | BlockType::Superblock => {
            DecodedBlock::Inode(Box::new(Dinode::parse(data)?))
        }
        BlockType::ExtentBlock => DecodedBlock::ExtentBlock(ExtentBlock::parse(data)?),
        BlockType::GroupDescriptor => DecodedBlock::GroupDescriptor(GroupDesc::parse(data)?),
        BlockType::DirBlock => DecodedBlock::DirTrailer(DirTrailer::parse(data)?),
        kind @ (BlockType::Xattr | BlockType::Refcount | BlockType::DxRoot | BlockType::DxLeaf) => {
            DecodedBlock::Raw {
                kind,
                data: data.to_vec(),
            }
        }
        BlockType::Unknown => DecodedBlock::Unknown(data.to_vec()),
    })
}

/// Encode a decoded block back over `data`. Unknown blocks are a no-op;
/// raw blocks must match the buffer length.
pub fn encode_block(block: &DecodedBlock, data: &mut [u8]) -> Result<(), ParseError> {
    match block {
        DecodedBlock::Inode(inode) => inode.encode_into(data),
        DecodedBlock::ExtentBlock(eb) => eb.encode_into(data),
        DecodedBlock::GroupDescriptor(gd) => gd.encode_into(data),
        DecodedBlock::DirTrailer(trailer) => trailer.encode_into(data),
        DecodedBlock::Raw { data: raw, .. } => {
            if raw.len() != data.len() {
                return Err(ParseError::InvalidField {
                    field: "raw block",
                    reason: "length differs from the target buffer",
                });
            }
            data.copy_from_slice(raw);
            Ok(())
        }
        DecodedBlock::Unknown(_) => Ok(()),
    }
}
