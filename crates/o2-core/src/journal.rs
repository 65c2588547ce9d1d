//! Per-slot journal access: superblock inspection, block scans, and the
//! dirty flag that forces recovery on the next mount.

use crate::fs::Filesystem;
use crate::inode::CachedInode;
use crate::sysfile::SystemFile;
use crate::{corrupt, parse_to_o2_error};
use o2_error::{O2Error, Result};
use o2_extent::map_block;
use o2_journal::{DEFAULT_CHUNK_BYTES, ScanEvent, ScanSummary};
use o2_ondisk::inode::JOURNAL_DIRTY_FL;
use o2_ondisk::{InodeFlags, InodePayload, JournalSuperblock};
use std::ops::ControlFlow;
use tracing::debug;

impl Filesystem {
    /// Journal inode block for `slot`.
    pub fn journal_inode(&self, slot: u16) -> Result<u64> {
        self.system_inode(SystemFile::Journal, Some(slot))
    }

    /// Decode the JBD2 superblock in the first block of `slot`'s journal.
    pub fn read_journal_superblock(&self, slot: u16) -> Result<JournalSuperblock> {
        let blkno = self.journal_inode(slot)?;
        let inode = self.read_inode(blkno)?;
        let InodePayload::Extents(root) = &inode.id2 else {
            return Err(O2Error::InvalidArgument(format!(
                "journal inode {blkno} has no extent map"
            )));
        };
        let (first, _) = map_block(self.device(), self.geometry(), root, blkno, 0)?
            .ok_or_else(|| corrupt(blkno, "journal block 0 is not mapped"))?;
        let raw = self.read_block(first)?;
        JournalSuperblock::parse(&raw).map_err(|err| parse_to_o2_error(first, &err))
    }

    /// Classify every block of `slot`'s journal, handing events to
    /// `visitor` in journal order.
    pub fn scan_journal<F>(&self, slot: u16, visitor: F) -> Result<ScanSummary>
    where
        F: FnMut(ScanEvent) -> Result<ControlFlow<()>>,
    {
        let blkno = self.journal_inode(slot)?;
        let inode = self.read_inode(blkno)?;
        let summary = o2_journal::scan_journal(
            self.device(),
            self.geometry(),
            &inode,
            DEFAULT_CHUNK_BYTES,
            visitor,
        )?;
        debug!(slot, blocks = summary.blocks, unknown = summary.unknown_blocks, "journal_scan");
        Ok(summary)
    }

    /// Set the dirty flag on `slot`'s journal inode.
    pub fn mark_journal_dirty(&self, slot: u16) -> Result<()> {
        let blkno = self.journal_inode(slot)?;
        self.mark_journal_inode_dirty(blkno)?;
        debug!(slot, block = blkno, "journal_marked_dirty");
        Ok(())
    }

    /// Set the dirty flag on the journal inode at `blkno`.
    ///
    /// Inodes without the JOURNAL flag are rejected with `InvalidArgument`.
    pub fn mark_journal_inode_dirty(&self, blkno: u64) -> Result<()> {
        self.check_writable()?;
        let mut ci = CachedInode::read(self, blkno)?;
        if !ci.inode().flags.contains(InodeFlags::JOURNAL) {
            return Err(O2Error::InvalidArgument(format!(
                "inode {blkno} is not a journal"
            )));
        }
        let flags = ci.inode().journal_flags();
        ci.inode_mut().set_journal_flags(flags | JOURNAL_DIRTY_FL);
        ci.write(self)
    }

    /// Whether `slot`'s journal is flagged for recovery.
    pub fn journal_is_dirty(&self, slot: u16) -> Result<bool> {
        let inode = self.read_inode(self.journal_inode(slot)?)?;
        Ok(inode.journal_flags() & JOURNAL_DIRTY_FL != 0)
    }
}
