#![forbid(unsafe_code)]
//! Volume-level operations for the o2 metadata engine.
//!
//! [`Filesystem`] opens a volume, validates its superblock and feature
//! words, and resolves the system inode table. On top of it sit cached
//! inodes with lazily loaded allocator views, directory and path
//! operations, backup superblock maintenance, journal inspection, and the
//! cluster lock interface.
//!
//! ```no_run
//! use o2_core::{Filesystem, OpenOptions};
//!
//! let fs = Filesystem::open("volume.img", &OpenOptions::new())?;
//! let inode = fs.resolve_path("/etc/motd")?;
//! let bytes = fs.read_file(inode)?;
//! println!("{}", String::from_utf8_lossy(&bytes));
//! fs.close()?;
//! # Ok::<(), o2_error::O2Error>(())
//! ```

pub mod backup;
pub mod dir;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod lock;
pub mod sysfile;

pub use backup::{MAX_BACKUP_SUPERBLOCKS, backup_super_blkno, backup_super_offsets};
pub use dir::{EntryPos, MAX_SYMLINK_DEPTH};
pub use fs::{Filesystem, OpenOptions};
pub use inode::CachedInode;
pub use lock::{ClusterLock, LocalLock, LockLevel, LockResource, LockType, with_lock};
pub use sysfile::{SystemFile, SystemInode, SystemInodes};

pub use o2_alloc::{AllocHint, Allocation, ChainAllocator, GroupSummary};
pub use o2_dir::{DirAction, IterFlags};
pub use o2_error::{O2Error, Result};
pub use o2_journal::{ScanEvent, ScanSummary};
pub use o2_ondisk::{
    DirEntry, Dinode, FeatureDiagnostics, FileType, JournalSuperblock, Superblock,
};
pub use o2_types::{BlockNumber, ClusterNumber, Geometry, ParseError, SlotNumber};

/// Attach the block a structure was read from to a parse failure.
#[must_use]
pub fn parse_to_o2_error(block: u64, err: &ParseError) -> O2Error {
    corrupt(block, err.to_string())
}

pub(crate) fn corrupt(block: u64, detail: impl Into<String>) -> O2Error {
    O2Error::Corruption {
        block,
        detail: detail.into(),
    }
}
