#![forbid(unsafe_code)]
//! Extent tree addressing: logical cluster to physical block resolution.
//!
//! An inode's extent list is either a leaf (depth 0) holding data extents
//! directly, or an interior list whose records name `EXBLK01` extent blocks
//! one level down. Lookups descend until a leaf answers, returning the
//! mapped block plus the contiguous run still covered by the same record so
//! bulk readers advance a whole extent at a time.
//!
//! Depth 0: the inode holds up to `(blocksize - 208) / 16` extents
//!          (243 at 4K blocks).
//! Depth n: each extent block holds up to `(blocksize - 80) / 16` records
//!          (251 at 4K blocks).

use o2_block::BlockDevice;
use o2_error::{O2Error, Result};
use o2_ondisk::extent::{MAX_EXTENT_DEPTH, extent_recs_per_block};
use o2_ondisk::{Dinode, ExtentBlock, ExtentList, ExtentRec, InodePayload};
use o2_types::{BlockNumber, Geometry, u64_to_usize};
use std::ops::ControlFlow;
use tracing::{debug, error, trace};

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Result of resolving one logical cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentLookup {
    /// The cluster is mapped.
    Mapped {
        /// Physical block holding the first block of the target cluster.
        blkno: u64,
        /// Clusters from the target to the end of its record, target included.
        run: u32,
        /// Extent record flags (unwritten, refcounted).
        flags: u8,
    },
    /// Sparse gap of `clusters` clusters before the next record.
    Hole { clusters: u32 },
    /// The target lies past the last record.
    BeyondEnd,
}

fn corrupt(block: u64, detail: impl Into<String>) -> O2Error {
    O2Error::Corruption {
        block,
        detail: detail.into(),
    }
}

/// Resolve logical cluster `cpos` through the tree rooted at `root`.
///
/// `owner` is the inode block, reported in corruption errors found in the
/// root list. Extent blocks read on the way down are dropped before return.
pub fn lookup(
    dev: &dyn BlockDevice,
    geom: Geometry,
    root: &ExtentList,
    owner: u64,
    cpos: u32,
) -> Result<ExtentLookup> {
    if root.tree_depth > MAX_EXTENT_DEPTH {
        return Err(corrupt(
            owner,
            format!(
                "extent tree depth {} exceeds {MAX_EXTENT_DEPTH}",
                root.tree_depth
            ),
        ));
    }
    lookup_in(dev, geom, root, owner, cpos)
}

fn lookup_in(
    dev: &dyn BlockDevice,
    geom: Geometry,
    list: &ExtentList,
    block: u64,
    cpos: u32,
) -> Result<ExtentLookup> {
    check_order(list, block)?;
    if list.is_leaf() {
        return Ok(search_leaf(geom, list, cpos));
    }

    let pos = list.recs.partition_point(|rec| rec.cpos <= cpos);
    if pos == 0 {
        return Ok(match list.recs.first() {
            Some(first) => ExtentLookup::Hole {
                clusters: first.cpos - cpos,
            },
            None => ExtentLookup::BeyondEnd,
        });
    }
    let parent = &list.recs[pos - 1];
    let limit = list.recs.get(pos).map(|next| next.cpos);
    let child = read_extent_block(dev, parent.blkno, list.tree_depth - 1)?;
    check_child_range(&child, parent.cpos, limit)?;
    let found = lookup_in(dev, geom, &child.list, child.blkno, cpos)?;
    // A gap past the end of a middle subtree is a hole, not the end.
    Ok(match (found, limit) {
        (ExtentLookup::BeyondEnd, Some(end)) => ExtentLookup::Hole {
            clusters: end - cpos,
        },
        (other, _) => other,
    })
}

/// A child block's records must lie inside the range its parent record
/// covers: from the parent's `cpos` up to the next parent record.
fn check_child_range(child: &ExtentBlock, start: u32, limit: Option<u32>) -> Result<()> {
    for rec in &child.list.recs {
        let past_limit = limit.is_some_and(|limit| rec.end_cpos() > u64::from(limit));
        if rec.cpos < start || past_limit {
            error!(
                block = child.blkno,
                cpos = rec.cpos,
                clusters = rec.clusters,
                start,
                ?limit,
                "extent_child_outside_parent"
            );
            return Err(corrupt(
                child.blkno,
                format!(
                    "record at cpos {} (+{}) outside parent range starting at {start}",
                    rec.cpos, rec.clusters
                ),
            ));
        }
    }
    Ok(())
}

/// Binary search a leaf for the record covering `cpos`.
fn search_leaf(geom: Geometry, list: &ExtentList, cpos: u32) -> ExtentLookup {
    let pos = list.recs.partition_point(|rec| rec.cpos <= cpos);
    if pos > 0 {
        let rec = &list.recs[pos - 1];
        if rec.contains(cpos) {
            let offset = cpos - rec.cpos;
            return ExtentLookup::Mapped {
                blkno: rec.blkno + geom.clusters_to_blocks(u64::from(offset)),
                run: rec.clusters - offset,
                flags: rec.flags,
            };
        }
    }
    match list.recs.get(pos) {
        Some(next) => ExtentLookup::Hole {
            clusters: next.cpos - cpos,
        },
        None => ExtentLookup::BeyondEnd,
    }
}

fn check_order(list: &ExtentList, block: u64) -> Result<()> {
    for pair in list.recs.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let overlaps = list.is_leaf() && prev.end_cpos() > u64::from(next.cpos);
        if prev.cpos >= next.cpos || overlaps {
            error!(
                block,
                prev_cpos = prev.cpos,
                next_cpos = next.cpos,
                "extent_invariant_violation"
            );
            return Err(corrupt(
                block,
                format!(
                    "extent records out of order or overlapping: cpos {} then {}",
                    prev.cpos, next.cpos
                ),
            ));
        }
    }
    Ok(())
}

/// Read and validate the extent block at `blkno`, expected at `depth`.
pub fn read_extent_block(dev: &dyn BlockDevice, blkno: u64, depth: u16) -> Result<ExtentBlock> {
    let buf = dev.read_block(BlockNumber(blkno))?;
    let eb = ExtentBlock::parse(buf.as_slice()).map_err(|err| corrupt(blkno, err.to_string()))?;
    if eb.list.tree_depth != depth {
        return Err(corrupt(
            blkno,
            format!(
                "extent tree depth mismatch: expected {depth}, got {}",
                eb.list.tree_depth
            ),
        ));
    }
    let capacity = extent_recs_per_block(buf.as_slice().len());
    if eb.list.count != capacity {
        return Err(corrupt(
            blkno,
            format!(
                "extent block record count mismatch: expected {capacity}, got {}",
                eb.list.count
            ),
        ));
    }
    if eb.blkno != blkno {
        return Err(corrupt(
            blkno,
            format!("extent block claims to live at block {}", eb.blkno),
        ));
    }
    if depth > 0 && eb.list.recs.is_empty() {
        return Err(corrupt(blkno, "interior extent block has no records"));
    }
    trace!(block = blkno, depth, recs = eb.list.recs.len(), "extent_block");
    Ok(eb)
}

/// Map logical block `v_blkno` to a physical block and the number of
/// contiguous blocks that follow it in the same extent, itself included.
///
/// Holes, unwritten extents, and offsets past the end return `None`.
pub fn map_block(
    dev: &dyn BlockDevice,
    geom: Geometry,
    root: &ExtentList,
    owner: u64,
    v_blkno: u64,
) -> Result<Option<(u64, u64)>> {
    let shift = geom.cluster_shift();
    let Ok(cpos) = u32::try_from(v_blkno >> shift) else {
        return Ok(None);
    };
    let within = v_blkno & (u64::from(geom.blocks_per_cluster()) - 1);
    match lookup(dev, geom, root, owner, cpos)? {
        ExtentLookup::Mapped { blkno, run, flags }
            if flags & o2_ondisk::extent::EXTENT_FLAG_UNWRITTEN == 0 =>
        {
            let blocks = geom.clusters_to_blocks(u64::from(run)) - within;
            Ok(Some((blkno + within, blocks)))
        }
        _ => Ok(None),
    }
}

// ── Walk ────────────────────────────────────────────────────────────────────

/// Visit every leaf record in logical order, descending through extent
/// blocks. Returns the number of records visited.
pub fn walk_leaves<F>(
    dev: &dyn BlockDevice,
    root: &ExtentList,
    owner: u64,
    visitor: &mut F,
) -> Result<usize>
where
    F: FnMut(&ExtentRec) -> Result<()>,
{
    if root.tree_depth > MAX_EXTENT_DEPTH {
        return Err(corrupt(
            owner,
            format!(
                "extent tree depth {} exceeds {MAX_EXTENT_DEPTH}",
                root.tree_depth
            ),
        ));
    }
    walk_list(dev, root, owner, visitor)
}

fn walk_list<F>(
    dev: &dyn BlockDevice,
    list: &ExtentList,
    block: u64,
    visitor: &mut F,
) -> Result<usize>
where
    F: FnMut(&ExtentRec) -> Result<()>,
{
    check_order(list, block)?;
    if list.is_leaf() {
        for rec in &list.recs {
            visitor(rec)?;
        }
        return Ok(list.recs.len());
    }
    let mut count = 0;
    for (i, rec) in list.recs.iter().enumerate() {
        let child = read_extent_block(dev, rec.blkno, list.tree_depth - 1)?;
        check_child_range(&child, rec.cpos, list.recs.get(i + 1).map(|next| next.cpos))?;
        count += walk_list(dev, &child.list, child.blkno, visitor)?;
    }
    Ok(count)
}

/// Sum every leaf record and compare with the inode's cluster count.
///
/// A mismatch is reported as corruption of the owning inode and is never
/// corrected here.
pub fn verify_cluster_count(
    dev: &dyn BlockDevice,
    root: &ExtentList,
    owner: u64,
    expected: u32,
) -> Result<u64> {
    let mut total = 0_u64;
    walk_leaves(dev, root, owner, &mut |rec| {
        total += u64::from(rec.clusters);
        Ok(())
    })?;
    if total != u64::from(expected) {
        return Err(corrupt(
            owner,
            format!("extent records cover {total} clusters, inode reports {expected}"),
        ));
    }
    Ok(total)
}

// ── Bulk iteration ──────────────────────────────────────────────────────────

/// A contiguous span of a file's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub logical_block: u64,
    pub physical_block: u64,
    pub blocks: u64,
    pub unwritten: bool,
}

/// Visit each mapped run of the file in logical order, advancing by the
/// run length returned from each lookup. Holes are skipped.
///
/// Returns `ControlFlow::Break` if the visitor stopped early.
pub fn for_each_run<F>(
    dev: &dyn BlockDevice,
    geom: Geometry,
    root: &ExtentList,
    owner: u64,
    mut visitor: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(BlockRun) -> Result<ControlFlow<()>>,
{
    let mut cpos = 0_u32;
    loop {
        match lookup(dev, geom, root, owner, cpos)? {
            ExtentLookup::Mapped { blkno, run, flags } => {
                let flow = visitor(BlockRun {
                    logical_block: geom.clusters_to_blocks(u64::from(cpos)),
                    physical_block: blkno,
                    blocks: geom.clusters_to_blocks(u64::from(run)),
                    unwritten: flags & o2_ondisk::extent::EXTENT_FLAG_UNWRITTEN != 0,
                })?;
                if flow.is_break() {
                    return Ok(flow);
                }
                cpos = advance(cpos, run, owner)?;
            }
            ExtentLookup::Hole { clusters } => cpos = advance(cpos, clusters, owner)?,
            ExtentLookup::BeyondEnd => return Ok(ControlFlow::Continue(())),
        }
    }
}

fn advance(cpos: u32, by: u32, owner: u64) -> Result<u32> {
    if by == 0 {
        return Err(corrupt(owner, format!("zero-length extent at cpos {cpos}")));
    }
    Ok(cpos.saturating_add(by))
}

/// Visit every allocated block of the file as `(logical, physical)` pairs.
pub fn for_each_block<F>(
    dev: &dyn BlockDevice,
    geom: Geometry,
    root: &ExtentList,
    owner: u64,
    mut visitor: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(u64, u64) -> Result<ControlFlow<()>>,
{
    for_each_run(dev, geom, root, owner, |run| {
        for i in 0..run.blocks {
            if visitor(run.logical_block + i, run.physical_block + i)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    })
}

/// Read a file's contents, truncated to `i_size`.
///
/// Inline-data inodes and fast symlinks return their in-inode bytes. Holes
/// and unwritten extents read as zeros. An `i_size` larger than the
/// inode's clusters (or the volume) is corruption.
pub fn read_whole_file(dev: &dyn BlockDevice, geom: Geometry, inode: &Dinode) -> Result<Vec<u8>> {
    let size = u64_to_usize(inode.size, "i_size").map_err(|err| corrupt(inode.blkno, err.to_string()))?;
    match &inode.id2 {
        InodePayload::Inline(inline) => Ok(inline.data[..size.min(inline.data.len())].to_vec()),
        InodePayload::FastSymlink(target) => Ok(target[..size.min(target.len())].to_vec()),
        InodePayload::Extents(root) => {
            let capacity = allocated_bytes(geom, inode.clusters);
            if inode.size > capacity {
                return Err(corrupt(
                    inode.blkno,
                    format!(
                        "i_size {} exceeds the {capacity} bytes of {} clusters",
                        inode.size, inode.clusters
                    ),
                ));
            }
            let mut out = vec![0_u8; size];
            let bs = geom.block_len();
            let total_blocks = geom_blocks_for(size, bs);
            for_each_run(dev, geom, root, inode.blkno, |run| {
                if run.logical_block >= total_blocks {
                    return Ok(ControlFlow::Break(()));
                }
                if run.unwritten {
                    return Ok(ControlFlow::Continue(()));
                }
                let blocks = run.blocks.min(total_blocks - run.logical_block);
                let start = u64_to_usize(run.logical_block, "logical block")
                    .map_err(|err| corrupt(inode.blkno, err.to_string()))?
                    * bs;
                let len = u64_to_usize(blocks, "run length")
                    .map_err(|err| corrupt(inode.blkno, err.to_string()))?
                    * bs;
                let mut chunk = vec![0_u8; len];
                dev.read_blocks(BlockNumber(run.physical_block), &mut chunk)?;
                let end = (start + len).min(size);
                out[start..end].copy_from_slice(&chunk[..end - start]);
                Ok(ControlFlow::Continue(()))
            })?;
            debug!(inode = inode.blkno, bytes = size, "read_whole_file");
            Ok(out)
        }
        _ => Err(O2Error::InvalidArgument(format!(
            "inode {} carries no file data",
            inode.blkno
        ))),
    }
}

/// Bytes held by `clusters` clusters, bounded by the volume size.
#[must_use]
pub fn allocated_bytes(geom: Geometry, clusters: u32) -> u64 {
    let blocks = geom
        .clusters_to_blocks(u64::from(clusters))
        .min(geom.block_count());
    blocks.saturating_mul(u64::from(geom.block_size()))
}

fn geom_blocks_for(size: usize, block_len: usize) -> u64 {
    u64::try_from(size.div_ceil(block_len)).unwrap_or(u64::MAX)
}

// ── Append ──────────────────────────────────────────────────────────────────

/// Append a data extent to the end of a depth-0 list, merging with the last
/// record when both the logical and physical ranges are contiguous.
///
/// Deeper trees and full lists report `NoSpace`; growing the tree is left to
/// tools that own extent-block allocation.
pub fn append_extent(list: &mut ExtentList, geom: Geometry, rec: ExtentRec) -> Result<()> {
    if !list.is_leaf() {
        return Err(O2Error::NoSpace);
    }
    if rec.clusters == 0 || rec.clusters > u32::from(u16::MAX) {
        return Err(O2Error::InvalidArgument(format!(
            "leaf extent of {} clusters",
            rec.clusters
        )));
    }
    if let Some(last) = list.recs.last_mut() {
        if u64::from(rec.cpos) < last.end_cpos() {
            return Err(O2Error::InvalidArgument(format!(
                "extent at cpos {} overlaps the list tail ending at {}",
                rec.cpos,
                last.end_cpos()
            )));
        }
        let contiguous = last.end_cpos() == u64::from(rec.cpos)
            && last.blkno + geom.clusters_to_blocks(u64::from(last.clusters)) == rec.blkno
            && last.flags == rec.flags
            && last.clusters + rec.clusters <= u32::from(u16::MAX);
        if contiguous {
            last.clusters += rec.clusters;
            return Ok(());
        }
    }
    if list.is_full() {
        return Err(O2Error::NoSpace);
    }
    list.recs.push(rec);
    Ok(())
}
