#![forbid(unsafe_code)]
//! JBD2 write-ahead journal structures. All fields are big-endian.

use crate::features::{JournalCompat, JournalIncompat, JournalRoCompat};
use o2_types::{ParseError, read_be_u32, read_fixed, write_be_u32, write_bytes};
use serde::{Deserialize, Serialize};

pub const JBD2_MAGIC: u32 = 0xC03B_3998;
pub const JBD2_HEADER_LEN: usize = 12;

pub const TAG_FLAG_ESCAPE: u32 = 0x1;
pub const TAG_FLAG_SAME_UUID: u32 = 0x2;
pub const TAG_FLAG_DELETED: u32 = 0x4;
pub const TAG_FLAG_LAST_TAG: u32 = 0x8;

const TAG_UUID_LEN: usize = 16;
const REVOKE_HEADER_LEN: usize = 16;

/// Block type tag carried in every journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalBlockType {
    Descriptor,
    Commit,
    SuperblockV1,
    SuperblockV2,
    Revoke,
    Other(u32),
}

impl JournalBlockType {
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Descriptor,
            2 => Self::Commit,
            3 => Self::SuperblockV1,
            4 => Self::SuperblockV2,
            5 => Self::Revoke,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Descriptor => 1,
            Self::Commit => 2,
            Self::SuperblockV1 => 3,
            Self::SuperblockV2 => 4,
            Self::Revoke => 5,
            Self::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for JournalBlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Descriptor => f.write_str("descriptor"),
            Self::Commit => f.write_str("commit"),
            Self::SuperblockV1 => f.write_str("superblock v1"),
            Self::SuperblockV2 => f.write_str("superblock v2"),
            Self::Revoke => f.write_str("revoke"),
            Self::Other(raw) => write!(f, "type {raw}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalHeader {
    pub blocktype: JournalBlockType,
    pub sequence: u32,
}

impl JournalHeader {
    /// Decode the header, or `None` when the block lacks the journal magic.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, ParseError> {
        if read_be_u32(data, 0)? != JBD2_MAGIC {
            return Ok(None);
        }
        Ok(Some(Self {
            blocktype: JournalBlockType::from_raw(read_be_u32(data, 4)?),
            sequence: read_be_u32(data, 8)?,
        }))
    }

    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(data, 0, JBD2_MAGIC)?;
        write_be_u32(data, 4, self.blocktype.to_raw())?;
        write_be_u32(data, 8, self.sequence)
    }
}

/// True when `data` starts with the journal magic.
#[must_use]
pub fn is_journal_block(data: &[u8]) -> bool {
    matches!(read_be_u32(data, 0), Ok(JBD2_MAGIC))
}

/// Journal superblock: block 0 of the journal file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSuperblock {
    pub header: JournalHeader,
    pub blocksize: u32,
    pub maxlen: u32,
    pub first: u32,
    pub sequence: u32,
    pub start: u32,
    pub errno: i32,
    pub feature_compat: JournalCompat,
    pub feature_incompat: JournalIncompat,
    pub feature_ro_compat: JournalRoCompat,
    pub uuid: [u8; 16],
    pub nr_users: u32,
}

impl JournalSuperblock {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = JournalHeader::parse(data)?.ok_or(ParseError::InvalidMagic {
            expected: format!("{JBD2_MAGIC:#010x}"),
            actual: format!("{:#010x}", read_be_u32(data, 0).unwrap_or(0)),
        })?;
        if !matches!(
            header.blocktype,
            JournalBlockType::SuperblockV1 | JournalBlockType::SuperblockV2
        ) {
            return Err(ParseError::InvalidField {
                field: "h_blocktype",
                reason: "not a journal superblock",
            });
        }
        Ok(Self {
            header,
            blocksize: read_be_u32(data, 0x0C)?,
            maxlen: read_be_u32(data, 0x10)?,
            first: read_be_u32(data, 0x14)?,
            sequence: read_be_u32(data, 0x18)?,
            start: read_be_u32(data, 0x1C)?,
            errno: i32::from_ne_bytes(read_be_u32(data, 0x20)?.to_ne_bytes()),
            feature_compat: JournalCompat(read_be_u32(data, 0x24)?),
            feature_incompat: JournalIncompat(read_be_u32(data, 0x28)?),
            feature_ro_compat: JournalRoCompat(read_be_u32(data, 0x2C)?),
            uuid: read_fixed::<16>(data, 0x30)?,
            nr_users: read_be_u32(data, 0x40)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        self.header.encode_into(data)?;
        write_be_u32(data, 0x0C, self.blocksize)?;
        write_be_u32(data, 0x10, self.maxlen)?;
        write_be_u32(data, 0x14, self.first)?;
        write_be_u32(data, 0x18, self.sequence)?;
        write_be_u32(data, 0x1C, self.start)?;
        write_be_u32(data, 0x20, u32::from_ne_bytes(self.errno.to_ne_bytes()))?;
        write_be_u32(data, 0x24, self.feature_compat.0)?;
        write_be_u32(data, 0x28, self.feature_incompat.0)?;
        write_be_u32(data, 0x2C, self.feature_ro_compat.0)?;
        write_bytes(data, 0x30, &self.uuid)?;
        write_be_u32(data, 0x40, self.nr_users)
    }

    /// True when the log holds transactions still to be replayed.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.start != 0
    }
}

/// One entry of a descriptor block's tag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTag {
    /// Final filesystem block the following log block belongs to.
    pub blocknr: u64,
    pub flags: u32,
}

/// Decode the tag table of a descriptor block.
pub fn parse_descriptor_tags(
    data: &[u8],
    incompat: JournalIncompat,
) -> Result<Vec<DescriptorTag>, ParseError> {
    let wide = incompat.contains(JournalIncompat::BIT64);
    let tag_len = if wide { 12 } else { 8 };
    let mut tags = Vec::new();
    let mut at = JBD2_HEADER_LEN;
    while at + tag_len <= data.len() {
        let low = read_be_u32(data, at)?;
        let flags = read_be_u32(data, at + 4)?;
        let high = if wide { read_be_u32(data, at + 8)? } else { 0 };
        tags.push(DescriptorTag {
            blocknr: (u64::from(high) << 32) | u64::from(low),
            flags,
        });
        at += tag_len;
        if flags & TAG_FLAG_SAME_UUID == 0 {
            at += TAG_UUID_LEN;
        }
        if flags & TAG_FLAG_LAST_TAG != 0 {
            break;
        }
    }
    Ok(tags)
}

/// Decode the block numbers listed in a revoke block.
pub fn parse_revoke_records(
    data: &[u8],
    incompat: JournalIncompat,
) -> Result<Vec<u64>, ParseError> {
    let count = usize::try_from(read_be_u32(data, JBD2_HEADER_LEN)?)
        .map_err(|_| ParseError::IntegerConversion { field: "r_count" })?;
    if count < REVOKE_HEADER_LEN || count > data.len() {
        return Err(ParseError::InvalidField {
            field: "r_count",
            reason: "outside block",
        });
    }
    let wide = incompat.contains(JournalIncompat::BIT64);
    let rec_len = if wide { 8 } else { 4 };
    let mut out = Vec::with_capacity((count - REVOKE_HEADER_LEN) / rec_len);
    let mut at = REVOKE_HEADER_LEN;
    while at + rec_len <= count {
        let value = if wide {
            (u64::from(read_be_u32(data, at)?) << 32) | u64::from(read_be_u32(data, at + 4)?)
        } else {
            u64::from(read_be_u32(data, at)?)
        };
        out.push(value);
        at += rec_len;
    }
    Ok(out)
}
