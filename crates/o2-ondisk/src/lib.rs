#![forbid(unsafe_code)]
//! On-disk format for the o2 clustered filesystem.
//!
//! Pure parsing crate with no I/O. Every structure has a `parse` that decodes
//! a byte slice into a host-native value and an `encode_into` that writes it
//! back. Volume structures are little-endian; journal structures are
//! big-endian.

pub mod blocktype;
pub mod chain;
pub mod dirent;
pub mod extent;
pub mod features;
pub mod inode;
pub mod jbd2;

pub use blocktype::{BlockType, DecodedBlock, SIGNATURE_TABLE, decode_block, detect_block, encode_block};
pub use chain::{ChainList, ChainRec, GroupDesc, chain_recs_per_inode, group_bitmap_size};
pub use dirent::{DirEntry, DirTrailer, FileType, dir_rec_len, has_dir_trailer};
pub use extent::{
    ExtentBlock, ExtentList, ExtentRec, extent_recs_per_block, extent_recs_per_inode,
};
pub use features::{
    CompatFeatures, DynFeatures, FeatureDiagnostics, IncompatFeatures, InodeFlags,
    JournalCompat, JournalIncompat, JournalRoCompat, RoCompatFeatures,
};
pub use inode::{Dinode, InlineData, InodePayload, Superblock, new_dinode};
pub use jbd2::{
    DescriptorTag, JournalBlockType, JournalHeader, JournalSuperblock, is_journal_block,
    parse_descriptor_tags, parse_revoke_records,
};
