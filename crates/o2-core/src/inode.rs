//! Cached inode: one inode block held in memory, plus a lazily loaded
//! allocator view when the inode is a chain allocator.

use crate::fs::Filesystem;
use crate::parse_to_o2_error;
use crate::sysfile::SystemFile;
use o2_alloc::{AllocHint, Allocation, ChainAllocator};
use o2_error::Result;
use o2_ondisk::Dinode;
use std::collections::btree_map::Entry;
use tracing::{debug, trace};

/// An inode read from disk together with its raw block.
///
/// The raw block keeps bytes the decoded form does not model, so a write
/// changes only the fields held in [`Dinode`].
#[derive(Debug, Clone)]
pub struct CachedInode {
    blkno: u64,
    inode: Dinode,
    raw: Vec<u8>,
    chain: Option<ChainAllocator>,
}

impl CachedInode {
    /// Read and validate the inode at `blkno`.
    pub fn read(fs: &Filesystem, blkno: u64) -> Result<Self> {
        let (inode, raw) = fs.read_inode_raw(blkno)?;
        Ok(Self {
            blkno,
            inode,
            raw,
            chain: None,
        })
    }

    #[must_use]
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    #[must_use]
    pub fn inode(&self) -> &Dinode {
        &self.inode
    }

    pub fn inode_mut(&mut self) -> &mut Dinode {
        &mut self.inode
    }

    #[must_use]
    pub fn into_inode(self) -> Dinode {
        self.inode
    }

    /// Write dirty allocator groups, then the inode block.
    pub fn write(&mut self, fs: &Filesystem) -> Result<()> {
        fs.check_writable()?;
        if let Some(chain) = self.chain.as_mut() {
            chain.write(fs.device())?;
        }
        self.inode
            .encode_into(&mut self.raw)
            .map_err(|err| parse_to_o2_error(self.blkno, &err))?;
        fs.write_block(self.blkno, &self.raw)?;
        debug!(block = self.blkno, "inode_write");
        Ok(())
    }

    /// Drop the allocator view and re-read the inode from disk.
    pub fn refresh(&mut self, fs: &Filesystem) -> Result<()> {
        let (inode, raw) = fs.read_inode_raw(self.blkno)?;
        self.inode = inode;
        self.raw = raw;
        self.chain = None;
        Ok(())
    }

    /// The allocator view, if it has been loaded.
    #[must_use]
    pub fn allocator(&self) -> Option<&ChainAllocator> {
        self.chain.as_ref()
    }

    /// Whether the allocator view holds changes not yet written.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.chain.as_ref().is_some_and(ChainAllocator::is_dirty)
    }

    /// Load the allocator view on first use.
    pub fn load_allocator(&mut self, fs: &Filesystem) -> Result<&ChainAllocator> {
        Ok(self.chain_parts(fs)?.0)
    }

    fn chain_parts(&mut self, fs: &Filesystem) -> Result<(&mut ChainAllocator, &mut Dinode)> {
        let chain = match self.chain.take() {
            Some(chain) => chain,
            None => ChainAllocator::load(
                fs.device(),
                fs.geometry(),
                &self.inode,
                fs.superblock().first_cluster_group,
            )?,
        };
        Ok((self.chain.insert(chain), &mut self.inode))
    }

    pub(crate) fn alloc_bits(&mut self, fs: &Filesystem, count: u32, hint: AllocHint) -> Result<Allocation> {
        let (chain, inode) = self.chain_parts(fs)?;
        chain.allocate(inode, count, hint)
    }

    pub(crate) fn free_bits(&mut self, fs: &Filesystem, start: u64, count: u32) -> Result<()> {
        let (chain, inode) = self.chain_parts(fs)?;
        chain.free(inode, start, count)
    }

    pub(crate) fn test_bit(&mut self, fs: &Filesystem, unit: u64) -> Result<bool> {
        let (chain, _) = self.chain_parts(fs)?;
        chain.test(unit)
    }

    pub(crate) fn force_bit(&mut self, fs: &Filesystem, unit: u64) -> Result<bool> {
        let (chain, inode) = self.chain_parts(fs)?;
        chain.force_allocated(inode, unit)
    }
}

// ── Shared allocators ───────────────────────────────────────────────────────

impl Filesystem {
    /// Run `f` on the handle's copy of a system allocator, reading the
    /// inode and its groups on first use.
    ///
    /// Every allocation and free on this handle goes through that one copy.
    /// `f` must not call another allocator method of the same handle.
    pub fn with_allocator<T>(
        &self,
        file: SystemFile,
        slot: Option<u16>,
        f: impl FnOnce(&mut CachedInode) -> Result<T>,
    ) -> Result<T> {
        let blkno = self.system_inode(file, slot)?;
        let mut cache = self.allocator_cache().lock();
        let ci = match cache.entry((file, slot)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                trace!(%file, ?slot, inode = blkno, "allocator_cached");
                entry.insert(CachedInode::read(self, blkno)?)
            }
        };
        ci.load_allocator(self)?;
        f(ci)
    }

    /// A copy of the cached allocator, for inspection.
    pub fn allocator_snapshot(&self, file: SystemFile, slot: Option<u16>) -> Result<CachedInode> {
        self.with_allocator(file, slot, |ci| Ok(ci.clone()))
    }

    /// Allocate `count` contiguous units. Nothing reaches disk until
    /// [`Filesystem::write_allocator`] or [`Filesystem::flush`].
    pub fn alloc_bits(
        &self,
        file: SystemFile,
        slot: Option<u16>,
        count: u32,
        hint: AllocHint,
    ) -> Result<Allocation> {
        self.check_writable()?;
        self.with_allocator(file, slot, |ci| ci.alloc_bits(self, count, hint))
    }

    pub fn free_bits(&self, file: SystemFile, slot: Option<u16>, start: u64, count: u32) -> Result<()> {
        self.check_writable()?;
        self.with_allocator(file, slot, |ci| ci.free_bits(self, start, count))
    }

    pub fn test_bit(&self, file: SystemFile, slot: Option<u16>, unit: u64) -> Result<bool> {
        self.with_allocator(file, slot, |ci| ci.test_bit(self, unit))
    }

    /// Mark `unit` allocated whatever its state, returning the old bit.
    pub fn force_bit(&self, file: SystemFile, slot: Option<u16>, unit: u64) -> Result<bool> {
        self.check_writable()?;
        self.with_allocator(file, slot, |ci| ci.force_bit(self, unit))
    }

    /// Write one cached allocator's dirty groups and inode.
    pub fn write_allocator(&self, file: SystemFile, slot: Option<u16>) -> Result<()> {
        self.with_allocator(file, slot, |ci| ci.write(self))
    }

    /// Write every cached allocator with unwritten changes, returning how
    /// many were written.
    pub fn write_allocators(&self) -> Result<usize> {
        let mut cache = self.allocator_cache().lock();
        let mut written = 0;
        for ci in cache.values_mut().filter(|ci| ci.is_dirty()) {
            ci.write(self)?;
            written += 1;
        }
        if written > 0 {
            debug!(written, "allocators_written");
        }
        Ok(written)
    }

    /// Drop the cached copy of an allocator, discarding unwritten changes.
    /// The next use re-reads it from disk.
    pub fn discard_allocator(&self, file: SystemFile, slot: Option<u16>) -> bool {
        self.allocator_cache().lock().remove(&(file, slot)).is_some()
    }
}
