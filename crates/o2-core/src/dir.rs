//! Directory walking, entry insertion and removal, directory growth, and
//! path resolution.

use crate::corrupt;
use crate::fs::Filesystem;
use crate::inode::CachedInode;
use crate::sysfile::SystemFile;
use o2_alloc::AllocHint;
use o2_dir::{DirAction, IterFlags, Region};
use o2_error::{O2Error, Result};
use o2_extent::{append_extent, for_each_block, map_block, read_whole_file};
use o2_ondisk::inode::INLINE_DATA_OFFSET;
use o2_ondisk::{DirEntry, Dinode, ExtentRec, FileType, InodePayload};
use o2_types::ClusterNumber;
use std::ops::ControlFlow;
use tracing::{debug, trace, warn};

/// Symlinks followed in one resolution before giving up with `SymlinkLoop`.
pub const MAX_SYMLINK_DEPTH: u32 = 5;

/// Where a visited entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPos {
    /// Directory block, or the inode block for inline directories.
    pub blkno: u64,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct RegionStep {
    changed: bool,
    stop: bool,
}

impl Filesystem {
    /// Hand each region of directory `dir` to `step` in logical order,
    /// writing back regions it reports as changed.
    fn walk_dir_regions<F>(&self, dir: u64, mut step: F) -> Result<()>
    where
        F: FnMut(&mut [u8], &Region) -> Result<RegionStep>,
    {
        let (inode, mut raw) = self.read_inode_raw(dir)?;
        if !inode.is_dir() {
            return Err(O2Error::NotDirectory);
        }
        match &inode.id2 {
            InodePayload::Inline(inline) => {
                let end = (INLINE_DATA_OFFSET + usize::from(inline.count)).min(raw.len());
                let region = Region::inline(dir, INLINE_DATA_OFFSET..end);
                if step(&mut raw, &region)?.changed {
                    self.write_block(dir, &raw)?;
                }
                Ok(())
            }
            InodePayload::Extents(root) => {
                let bs = self.block_len();
                let blocks = inode.size.div_ceil(bs as u64);
                let trailer = self.dir_blocks_have_trailer();
                for_each_block(self.device(), self.geometry(), root, dir, |logical, physical| {
                    if logical >= blocks {
                        return Ok(ControlFlow::Break(()));
                    }
                    let mut block = self.read_block(physical)?;
                    let region = Region::block(physical, bs, trailer);
                    let result = step(&mut block, &region)?;
                    if result.changed {
                        self.write_block(physical, &block)?;
                    }
                    Ok(if result.stop {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    })
                })?;
                Ok(())
            }
            _ => Err(corrupt(dir, "directory inode has no extent list or inline data")),
        }
    }

    /// Visit the entries of directory `dir` that `flags` select.
    ///
    /// Entries the visitor marks changed are written back block by block;
    /// `Abort` stops the walk after the current block is written.
    pub fn dir_iterate<F>(&self, dir: u64, flags: IterFlags, mut visitor: F) -> Result<()>
    where
        F: FnMut(&mut DirEntry, EntryPos) -> Result<DirAction>,
    {
        self.walk_dir_regions(dir, |buf, region| {
            let visit = o2_dir::iterate_region(buf, region, flags, |entry, offset| {
                visitor(
                    entry,
                    EntryPos {
                        blkno: region.blkno,
                        offset,
                    },
                )
            })?;
            Ok(RegionStep {
                changed: visit.changed,
                stop: visit.aborted,
            })
        })
    }

    /// Live entries of `dir`, `.` and `..` included.
    pub fn read_dir(&self, dir: u64) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        self.dir_iterate(dir, IterFlags::default(), |entry, _| {
            out.push(entry.clone());
            Ok(DirAction::Continue)
        })?;
        Ok(out)
    }

    /// Inode named `name` in `dir`, or `None`.
    pub fn lookup(&self, dir: u64, name: &[u8]) -> Result<Option<u64>> {
        let mut found = None;
        self.walk_dir_regions(dir, |buf, region| {
            found = o2_dir::lookup_in_region(buf, region, name)?.map(|entry| entry.inode);
            Ok(RegionStep {
                changed: false,
                stop: found.is_some(),
            })
        })?;
        trace!(dir, name = %String::from_utf8_lossy(name), found = ?found, "dir_lookup");
        Ok(found)
    }

    fn lookup_required(&self, dir: u64, name: &[u8]) -> Result<u64> {
        self.lookup(dir, name)?
            .ok_or_else(|| O2Error::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Add `name -> inode` to `dir` without growing it.
    ///
    /// Fails with `DirFull` when no existing record has room.
    pub fn insert_entry(&self, dir: u64, name: &[u8], inode: u64, file_type: FileType) -> Result<()> {
        self.check_writable()?;
        self.check_inode_blkno(inode)?;
        let mut placed = false;
        self.walk_dir_regions(dir, |buf, region| {
            let outcome = o2_dir::insert_entry(buf, region, inode, name, file_type)?;
            placed = outcome.placed.is_some();
            Ok(RegionStep {
                changed: outcome.changed,
                stop: placed,
            })
        })?;
        if placed {
            debug!(dir, inode, name = %String::from_utf8_lossy(name), "dir_insert");
            Ok(())
        } else {
            Err(O2Error::DirFull)
        }
    }

    /// Add `name -> inode` to `dir`, growing the directory by one block if
    /// it is full. Existing names are rejected with `Exists`.
    pub fn link(&self, dir: u64, name: &[u8], inode: u64, file_type: FileType) -> Result<()> {
        if self.lookup(dir, name)?.is_some() {
            return Err(O2Error::Exists);
        }
        match self.insert_entry(dir, name, inode, file_type) {
            Err(O2Error::DirFull) => {
                self.expand_dir(dir)?;
                self.insert_entry(dir, name, inode, file_type)
            }
            other => other,
        }
    }

    /// Remove `name` from `dir`, optionally only if it points at `inode`.
    /// Returns the inode the entry pointed at.
    pub fn unlink(&self, dir: u64, name: &[u8], inode: Option<u64>) -> Result<u64> {
        self.check_writable()?;
        let mut removed = None;
        self.walk_dir_regions(dir, |buf, region| {
            removed = o2_dir::remove_entry(buf, region, name, inode)?;
            Ok(RegionStep {
                changed: removed.is_some(),
                stop: removed.is_some(),
            })
        })?;
        let removed =
            removed.ok_or_else(|| O2Error::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        debug!(dir, inode = removed, name = %String::from_utf8_lossy(name), "dir_unlink");
        Ok(removed)
    }

    /// Append one block to directory `dir` and return its block number.
    ///
    /// The block comes from the directory's last cluster when it has room;
    /// otherwise one cluster is taken from the global bitmap. The first
    /// block of a directory gets `.` and `..`; later blocks are one unused
    /// record. Inline directories cannot grow here and report `NoSpace`.
    ///
    /// The new block and the directory inode are written before the bitmap.
    /// If either write fails the cluster goes back to the bitmap.
    pub fn expand_dir(&self, dir: u64) -> Result<u64> {
        self.check_writable()?;
        let mut ci = CachedInode::read(self, dir)?;
        if !ci.inode().is_dir() {
            return Err(O2Error::NotDirectory);
        }
        let bs = self.block_len();
        let geom = self.geometry();
        let used = ci.inode().size / bs as u64;
        let allocated = geom.clusters_to_blocks(u64::from(ci.inode().clusters));

        let mapped = match &ci.inode().id2 {
            InodePayload::Extents(root) if used < allocated => Some(
                map_block(self.device(), geom, root, dir, used)?
                    .map(|(blkno, _)| blkno)
                    .ok_or_else(|| corrupt(dir, format!("allocated directory block {used} is unmapped")))?,
            ),
            InodePayload::Extents(_) => None,
            _ => return Err(O2Error::NoSpace),
        };
        let (physical, grown) = match mapped {
            Some(blkno) => (blkno, None),
            None => {
                let (blkno, cluster) = self.grow_by_cluster(&mut ci)?;
                (blkno, Some(cluster))
            }
        };

        let trailer = self.dir_blocks_have_trailer();
        let region = Region::block(physical, bs, trailer);
        let mut block = vec![0_u8; bs];
        if trailer {
            o2_dir::init_trailer(&mut block, physical, dir)?;
        }
        if used == 0 {
            o2_dir::init_dot_entries(&mut block, &region, dir, dir)?;
        } else {
            o2_dir::init_empty_entries(&mut block, &region)?;
        }
        ci.inode_mut().size += bs as u64;
        let written = self
            .write_block(physical, &block)
            .and_then(|()| ci.write(self));
        if let Err(err) = written {
            if let Some(cluster) = grown {
                self.release_cluster(dir, cluster);
            }
            return Err(err);
        }
        if grown.is_some() {
            self.write_allocator(SystemFile::GlobalBitmap, None)?;
        }
        debug!(dir, block = physical, logical = used, "dir_expand");
        Ok(physical)
    }

    /// Return a cluster taken by a failed expansion to the cached bitmap.
    fn release_cluster(&self, dir: u64, cluster: u64) {
        match self.free_bits(SystemFile::GlobalBitmap, None, cluster, 1) {
            Ok(()) => debug!(dir, cluster, "dir_cluster_released"),
            Err(err) => warn!(dir, cluster, error = %err, "dir_cluster_release_failed"),
        }
    }

    /// Give `ci` one more cluster from the global bitmap, returning its
    /// first block and the cluster number. Only the cached bitmap and the
    /// extent list change; the caller writes both.
    fn grow_by_cluster(&self, ci: &mut CachedInode) -> Result<(u64, u64)> {
        let geom = self.geometry();
        let has_room = ci
            .inode()
            .extent_list()
            .is_some_and(|list| list.is_leaf() && !list.is_full());
        if !has_room {
            return Err(O2Error::NoSpace);
        }
        let alloc = self.alloc_bits(SystemFile::GlobalBitmap, None, 1, AllocHint::default())?;
        let blkno = geom.cluster_to_block(ClusterNumber(alloc.start)).0;
        let rec = ExtentRec {
            cpos: ci.inode().clusters,
            clusters: 1,
            flags: 0,
            blkno,
        };
        let appended = match ci.inode_mut().extent_list_mut() {
            Some(list) => append_extent(list, geom, rec),
            None => Err(O2Error::NoSpace),
        };
        if let Err(err) = appended {
            self.free_bits(SystemFile::GlobalBitmap, None, alloc.start, 1)?;
            return Err(err);
        }
        ci.inode_mut().clusters += 1;
        debug!(inode = ci.blkno(), cluster = alloc.start, "dir_cluster_added");
        Ok((blkno, alloc.start))
    }

    // ── Path resolution ────────────────────────────────────────────────────

    /// Resolve `path` from `cwd` (or `root` when absolute) without
    /// following a symlink in the final component.
    pub fn namei(&self, root: u64, cwd: u64, path: &str) -> Result<u64> {
        self.open_namei(root, cwd, path.as_bytes(), false, 0)
    }

    /// Like [`Filesystem::namei`], but the final component is followed too.
    pub fn namei_follow(&self, root: u64, cwd: u64, path: &str) -> Result<u64> {
        self.open_namei(root, cwd, path.as_bytes(), true, 0)
    }

    /// Resolve a path from the volume root, following every symlink.
    pub fn resolve_path(&self, path: &str) -> Result<u64> {
        let root = self.root_blkno();
        self.namei_follow(root, root, path)
    }

    fn open_namei(&self, root: u64, base: u64, path: &[u8], follow: bool, depth: u32) -> Result<u64> {
        let (dir, last) = self.dir_namei(root, base, path, depth)?;
        if last.is_empty() {
            return Ok(dir);
        }
        let inode = self.lookup_required(dir, last)?;
        if follow {
            self.follow_link(root, dir, inode, depth)
        } else {
            Ok(inode)
        }
    }

    /// Walk every component but the last, returning the directory reached
    /// and the final component.
    fn dir_namei<'p>(&self, root: u64, base: u64, path: &'p [u8], depth: u32) -> Result<(u64, &'p [u8])> {
        let (mut dir, rest) = match path.strip_prefix(b"/") {
            Some(rest) => (root, rest),
            None => (base, path),
        };
        let mut components = rest.split(|&b| b == b'/');
        let mut current = components.next().unwrap_or_default();
        for next in components {
            if !current.is_empty() {
                let inode = self.lookup_required(dir, current)?;
                dir = self.follow_link(root, dir, inode, depth)?;
            }
            current = next;
        }
        Ok((dir, current))
    }

    /// If `inode` is a symlink, resolve its target relative to `dir`.
    fn follow_link(&self, root: u64, dir: u64, inode: u64, depth: u32) -> Result<u64> {
        let link = self.read_inode(inode)?;
        if !link.is_symlink() {
            return Ok(inode);
        }
        if depth >= MAX_SYMLINK_DEPTH {
            debug!(inode, depth, "symlink_depth_exceeded");
            return Err(O2Error::SymlinkLoop);
        }
        let target = self.read_link_target(&link)?;
        trace!(inode, target = %String::from_utf8_lossy(&target), depth, "follow_link");
        self.open_namei(root, dir, &target, true, depth + 1)
    }

    /// Bytes of a symlink's target.
    pub fn read_link_target(&self, link: &Dinode) -> Result<Vec<u8>> {
        if !link.is_symlink() {
            return Err(O2Error::InvalidArgument(format!(
                "inode {} is not a symlink",
                link.blkno
            )));
        }
        if link.size > self.block_len() as u64 {
            return Err(corrupt(
                link.blkno,
                format!("symlink size {} exceeds one block", link.size),
            ));
        }
        read_whole_file(self.device(), self.geometry(), link)
    }

    /// Contents of a regular file or symlink, truncated to its size.
    pub fn read_file(&self, inode: u64) -> Result<Vec<u8>> {
        let inode = self.read_inode(inode)?;
        if inode.is_dir() {
            return Err(O2Error::InvalidArgument(format!(
                "inode {} is a directory",
                inode.blkno
            )));
        }
        read_whole_file(self.device(), self.geometry(), &inode)
    }
}
