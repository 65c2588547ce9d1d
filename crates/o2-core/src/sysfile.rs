//! System inode names and the table built from the system directory.

use serde::Serialize;
use std::fmt;

/// A well-known file in the system directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemFile {
    BadBlocks,
    GlobalInodeAlloc,
    SlotMap,
    Heartbeat,
    GlobalBitmap,
    OrphanDir,
    ExtentAlloc,
    InodeAlloc,
    Journal,
    LocalAlloc,
    TruncateLog,
}

impl SystemFile {
    pub const ALL: [Self; 11] = [
        Self::BadBlocks,
        Self::GlobalInodeAlloc,
        Self::SlotMap,
        Self::Heartbeat,
        Self::GlobalBitmap,
        Self::OrphanDir,
        Self::ExtentAlloc,
        Self::InodeAlloc,
        Self::Journal,
        Self::LocalAlloc,
        Self::TruncateLog,
    ];

    /// Name stem as stored in the system directory.
    #[must_use]
    pub fn stem(self) -> &'static str {
        match self {
            Self::BadBlocks => "bad_blocks",
            Self::GlobalInodeAlloc => "global_inode_alloc",
            Self::SlotMap => "slot_map",
            Self::Heartbeat => "heartbeat",
            Self::GlobalBitmap => "global_bitmap",
            Self::OrphanDir => "orphan_dir",
            Self::ExtentAlloc => "extent_alloc",
            Self::InodeAlloc => "inode_alloc",
            Self::Journal => "journal",
            Self::LocalAlloc => "local_alloc",
            Self::TruncateLog => "truncate_log",
        }
    }

    /// Whether each slot owns its own copy (`name:NNNN`).
    #[must_use]
    pub fn is_per_slot(self) -> bool {
        matches!(
            self,
            Self::OrphanDir
                | Self::ExtentAlloc
                | Self::InodeAlloc
                | Self::Journal
                | Self::LocalAlloc
                | Self::TruncateLog
        )
    }

    /// Directory entry name for this file. Per-slot files need `slot`;
    /// global files ignore it.
    #[must_use]
    pub fn file_name(self, slot: Option<u16>) -> Option<String> {
        match (self.is_per_slot(), slot) {
            (true, Some(slot)) => Some(format!("{}:{slot:04}", self.stem())),
            (true, None) => None,
            (false, _) => Some(self.stem().to_owned()),
        }
    }

    /// Inverse of [`SystemFile::file_name`]. Names outside the table
    /// (quota files, user additions) yield `None`.
    #[must_use]
    pub fn parse_name(name: &[u8]) -> Option<(Self, Option<u16>)> {
        let name = std::str::from_utf8(name).ok()?;
        let (stem, slot) = match name.split_once(':') {
            Some((stem, digits)) => {
                if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                (stem, Some(digits.parse::<u16>().ok()?))
            }
            None => (name, None),
        };
        let kind = Self::ALL.into_iter().find(|k| k.stem() == stem)?;
        (kind.is_per_slot() == slot.is_some()).then_some((kind, slot))
    }
}

impl fmt::Display for SystemFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// One resolved system directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemInode {
    pub file: SystemFile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u16>,
    pub blkno: u64,
}

/// System inodes found at open time, sorted by kind then slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SystemInodes {
    entries: Vec<SystemInode>,
}

impl SystemInodes {
    pub(crate) fn insert(&mut self, entry: SystemInode) {
        match self
            .entries
            .binary_search_by_key(&(entry.file, entry.slot), |e| (e.file, e.slot))
        {
            Ok(idx) => self.entries[idx] = entry,
            Err(idx) => self.entries.insert(idx, entry),
        }
    }

    #[must_use]
    pub fn get(&self, file: SystemFile, slot: Option<u16>) -> Option<u64> {
        let slot = if file.is_per_slot() { slot } else { None };
        self.entries
            .binary_search_by_key(&(file, slot), |e| (e.file, e.slot))
            .ok()
            .map(|idx| self.entries[idx].blkno)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SystemInode> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
