#![forbid(unsafe_code)]
//! Directory entry records and the directory block trailer.

use crate::inode::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
use o2_types::{
    MAX_FILENAME_LEN, ParseError, ensure_slice, read_le_u16, read_le_u64, read_u8, write_bytes,
    write_le_u16, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

/// Fixed bytes before the name: inode, rec_len, name_len, file_type.
pub const DIR_ENTRY_HEADER_LEN: usize = 12;
pub const DIR_ROUND: usize = 4;

pub const DIR_TRAILER_SIGNATURE: &[u8] = b"DIRTRL1";
pub const DIR_TRAILER_LEN: usize = 64;
/// Offset of the signature inside the trailer.
pub const DIR_TRAILER_SIG_OFFSET: usize = 16;

/// Record length needed to hold a name of `name_len` bytes.
#[must_use]
pub const fn dir_rec_len(name_len: usize) -> usize {
    (name_len + DIR_ENTRY_HEADER_LEN + DIR_ROUND - 1) & !(DIR_ROUND - 1)
}

/// Byte offset of the trailer in a block of `block_size`.
#[must_use]
pub const fn dir_trailer_offset(block_size: usize) -> usize {
    block_size.saturating_sub(DIR_TRAILER_LEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Unknown,
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Regular,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Regular => 1,
            Self::Directory => 2,
            Self::CharDevice => 3,
            Self::BlockDevice => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
        }
    }

    /// File type implied by an inode's mode bits.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// One decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Target inode block; zero marks an unused record.
    pub inode: u64,
    pub rec_len: u16,
    pub file_type: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.inode != 0
    }

    #[must_use]
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }

    /// Bytes this entry actually needs.
    #[must_use]
    pub fn min_rec_len(&self) -> usize {
        dir_rec_len(self.name.len())
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Parse the record at `offset`, checking it stays inside `limit`.
    pub fn parse(data: &[u8], offset: usize, limit: usize) -> Result<Self, ParseError> {
        let inode = read_le_u64(data, offset)?;
        let rec_len = read_le_u16(data, offset + 8)?;
        let name_len = read_u8(data, offset + 10)?;
        let file_type = read_u8(data, offset + 11)?;
        let rl = usize::from(rec_len);
        if rl < DIR_ENTRY_HEADER_LEN {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "smaller than entry header",
            });
        }
        if rl % DIR_ROUND != 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "not a multiple of 4",
            });
        }
        if usize::from(name_len) + DIR_ENTRY_HEADER_LEN > rl {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name overruns record",
            });
        }
        if offset + rl > limit {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "record crosses block end",
            });
        }
        let name =
            ensure_slice(data, offset + DIR_ENTRY_HEADER_LEN, usize::from(name_len))?.to_vec();
        Ok(Self {
            inode,
            rec_len,
            file_type: FileType::from_raw(file_type),
            name,
        })
    }

    pub fn encode_into(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        if self.name.len() > MAX_FILENAME_LEN {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name longer than 255 bytes",
            });
        }
        if self.min_rec_len() > usize::from(self.rec_len) {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "too small for name",
            });
        }
        let name_len = u8::try_from(self.name.len())
            .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
        write_le_u64(data, offset, self.inode)?;
        write_le_u16(data, offset + 8, self.rec_len)?;
        write_u8(data, offset + 10, name_len)?;
        write_u8(data, offset + 11, self.file_type.to_raw())?;
        write_bytes(data, offset + DIR_ENTRY_HEADER_LEN, &self.name)
    }
}

/// Trailer found at the end of directory blocks on volumes that index or
/// checksum directories. Poses as an empty record covering its 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirTrailer {
    pub compat_inode: u64,
    pub compat_rec_len: u16,
    pub compat_name_len: u8,
    /// Largest free record in the block.
    pub free_rec_len: u16,
    pub free_next: u64,
    pub blkno: u64,
    pub parent_dinode: u64,
}

impl DirTrailer {
    /// Parse the trailer of a whole directory block.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let base = dir_trailer_offset(block.len());
        let sig = ensure_slice(block, base + DIR_TRAILER_SIG_OFFSET, DIR_TRAILER_SIGNATURE.len())?;
        if sig != DIR_TRAILER_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: String::from_utf8_lossy(DIR_TRAILER_SIGNATURE).into_owned(),
                actual: String::from_utf8_lossy(sig).into_owned(),
            });
        }
        Ok(Self {
            compat_inode: read_le_u64(block, base)?,
            compat_rec_len: read_le_u16(block, base + 0x08)?,
            compat_name_len: read_u8(block, base + 0x0A)?,
            free_rec_len: read_le_u16(block, base + 0x0E)?,
            free_next: read_le_u64(block, base + 0x20)?,
            blkno: read_le_u64(block, base + 0x28)?,
            parent_dinode: read_le_u64(block, base + 0x30)?,
        })
    }

    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let base = dir_trailer_offset(block.len());
        write_le_u64(block, base, self.compat_inode)?;
        write_le_u16(block, base + 0x08, self.compat_rec_len)?;
        write_u8(block, base + 0x0A, self.compat_name_len)?;
        write_le_u16(block, base + 0x0E, self.free_rec_len)?;
        let mut sig = [0_u8; 8];
        sig[..DIR_TRAILER_SIGNATURE.len()].copy_from_slice(DIR_TRAILER_SIGNATURE);
        write_bytes(block, base + DIR_TRAILER_SIG_OFFSET, &sig)?;
        write_le_u64(block, base + 0x20, self.free_next)?;
        write_le_u64(block, base + 0x28, self.blkno)?;
        write_le_u64(block, base + 0x30, self.parent_dinode)
    }
}

/// True when the block ends in a directory trailer.
#[must_use]
pub fn has_dir_trailer(block: &[u8]) -> bool {
    let at = dir_trailer_offset(block.len()) + DIR_TRAILER_SIG_OFFSET;
    block.len() >= DIR_TRAILER_LEN
        && block.get(at..at + DIR_TRAILER_SIGNATURE.len()) == Some(DIR_TRAILER_SIGNATURE)
}
