#![forbid(unsafe_code)]
//! Chain allocator and bitmap engine.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitops** ([`bitops`]): raw bit manipulation and search over byte
//!    buffers.
//! 2. **Chain iteration** ([`chain`]): walk group descriptors through the
//!    allocator inode's chain list and their next-group links.
//! 3. **ChainAllocator**: an in-memory view of every group's bitmap,
//!    addressed by absolute allocator units, with first-fit allocation and
//!    free that keep the group, chain, and inode counters in step.
//!
//! A request is satisfied from a single run inside a single group. When no
//! group has a long enough free run the request fails with `NoSpace`, even
//! if the free bits summed over groups would suffice.

pub mod bitops;
pub mod chain;

use o2_block::BlockDevice;
use o2_error::{O2Error, Result};
use o2_ondisk::{Dinode, GroupDesc, group_bitmap_size};
use o2_types::{BlockNumber, Geometry};
use serde::Serialize;
use std::ops::ControlFlow;
use tracing::{debug, warn};

pub use chain::{LoadedGroup, chain_iterate, read_group_desc};

// ── Requests and results ────────────────────────────────────────────────────

/// Where to start looking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocHint {
    /// Chain index to scan first; the scan wraps around the chain array.
    pub chain: Option<u16>,
    /// Group descriptor block to try before any chain.
    pub group: Option<u64>,
}

/// A successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// First allocator unit (cluster or block, depending on the allocator).
    pub start: u64,
    pub count: u32,
    /// Group descriptor the run came from.
    pub group: u64,
    pub chain: u16,
}

/// Read-only view of one loaded group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub blkno: u64,
    pub chain: u16,
    pub start_unit: u64,
    pub bits: u16,
    pub free: u16,
}

// ── Chain allocator ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Group {
    desc: GroupDesc,
    raw: Vec<u8>,
    start_unit: u64,
    dirty: bool,
}

impl Group {
    fn contains(&self, unit: u64, count: u64) -> bool {
        unit >= self.start_unit
            && unit
                .checked_add(count)
                .is_some_and(|end| end <= self.start_unit + u64::from(self.desc.bits))
    }

    fn offset_of(&self, unit: u64) -> usize {
        usize::try_from(unit - self.start_unit).unwrap_or(usize::MAX)
    }
}

/// Bitmap view over every group of one chain-allocator inode.
#[derive(Debug, Clone)]
pub struct ChainAllocator {
    owner: u64,
    groups: Vec<Group>,
    dirty: bool,
}

/// First allocator unit covered by the group at `blkno`.
///
/// Units are `cluster_size / bpc` bytes wide, so a group's block number is
/// rescaled when units and blocks differ in size.
#[must_use]
pub fn scale_start_bit(geom: Geometry, blkno: u64, bpc: u16) -> u64 {
    let bitsize = geom.cluster_size() / u32::from(bpc.max(1));
    let bs = geom.block_size();
    match bitsize.cmp(&bs) {
        std::cmp::Ordering::Equal => blkno,
        std::cmp::Ordering::Less => blkno * u64::from(bs / bitsize.max(1)),
        std::cmp::Ordering::Greater => blkno / u64::from(bitsize / bs),
    }
}

impl ChainAllocator {
    /// Load every group reachable from `inode`'s chain list.
    ///
    /// The group at `first_cluster_group` starts at unit 0. Chain records
    /// whose free count disagrees with the sum over their groups are
    /// reported as corruption of the inode.
    pub fn load(
        dev: &dyn BlockDevice,
        geom: Geometry,
        inode: &Dinode,
        first_cluster_group: u64,
    ) -> Result<Self> {
        let chains = inode.chain_list().ok_or_else(|| {
            O2Error::InvalidArgument(format!("inode {} is not a chain allocator", inode.blkno))
        })?;
        if chains.bpc == 0 || u32::from(chains.bpc) > geom.cluster_size() {
            return Err(O2Error::Corruption {
                block: inode.blkno,
                detail: format!("invalid bits per cluster {}", chains.bpc),
            });
        }
        let expected_size = group_bitmap_size(geom.block_len());
        let mut groups = Vec::new();
        chain_iterate(dev, chains, inode.blkno, |_, loaded| {
            if loaded.desc.size != expected_size {
                return Err(O2Error::Corruption {
                    block: loaded.desc.blkno,
                    detail: format!(
                        "group bitmap size {} (expected {expected_size})",
                        loaded.desc.size
                    ),
                });
            }
            let base = if loaded.desc.blkno == first_cluster_group {
                0
            } else {
                loaded.desc.blkno
            };
            groups.push(Group {
                start_unit: scale_start_bit(geom, base, chains.bpc),
                desc: loaded.desc,
                raw: loaded.raw,
                dirty: false,
            });
            Ok(ControlFlow::Continue(()))
        })?;

        let alloc = Self {
            owner: inode.blkno,
            groups,
            dirty: false,
        };
        alloc.check_chain_counts(inode)?;
        debug!(
            inode = inode.blkno,
            groups = alloc.groups.len(),
            free = alloc.free_units(),
            "chain_allocator_loaded"
        );
        Ok(alloc)
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn free_units(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| u64::from(g.desc.free_bits_count))
            .sum()
    }

    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.groups.iter().map(|g| u64::from(g.desc.bits)).sum()
    }

    #[must_use]
    pub fn groups(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|g| GroupSummary {
                blkno: g.desc.blkno,
                chain: g.desc.chain,
                start_unit: g.start_unit,
                bits: g.desc.bits,
                free: g.desc.free_bits_count,
            })
            .collect()
    }

    /// Sum of group free counts per chain must match the chain records.
    fn check_chain_counts(&self, inode: &Dinode) -> Result<()> {
        let Some(chains) = inode.chain_list() else {
            return Ok(());
        };
        for (idx, rec) in chains.recs.iter().enumerate() {
            let free: u64 = self
                .groups
                .iter()
                .filter(|g| usize::from(g.desc.chain) == idx)
                .map(|g| u64::from(g.desc.free_bits_count))
                .sum();
            if free != u64::from(rec.free) {
                warn!(inode = inode.blkno, chain = idx, free, recorded = rec.free, "chain_free_mismatch");
                return Err(O2Error::Corruption {
                    block: inode.blkno,
                    detail: format!(
                        "chain {idx} records {} free bits, its groups hold {free}",
                        rec.free
                    ),
                });
            }
        }
        Ok(())
    }

    /// Full consistency check: chain sums plus each group's free count
    /// against its bitmap.
    pub fn verify(&self, inode: &Dinode) -> Result<()> {
        self.check_chain_counts(inode)?;
        for g in &self.groups {
            let used = bitops::count_set(&g.desc.bitmap, usize::from(g.desc.bits));
            let free = usize::from(g.desc.bits) - used;
            if free != usize::from(g.desc.free_bits_count) {
                return Err(O2Error::Corruption {
                    block: g.desc.blkno,
                    detail: format!(
                        "group records {} free bits, bitmap has {free}",
                        g.desc.free_bits_count
                    ),
                });
            }
        }
        Ok(())
    }

    fn search_order(&self, inode: &Dinode, hint: AllocHint) -> Vec<usize> {
        let chain_count = inode.chain_list().map_or(0, |cl| cl.recs.len());
        let mut order = Vec::with_capacity(self.groups.len());
        if let Some(blkno) = hint.group {
            order.extend(self.groups.iter().position(|g| g.desc.blkno == blkno));
        }
        let first = hint
            .chain
            .map_or(0, |c| usize::from(c) % chain_count.max(1));
        for step in 0..chain_count {
            let chain = (first + step) % chain_count;
            order.extend(
                self.groups
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| usize::from(g.desc.chain) == chain)
                    .map(|(i, _)| i),
            );
        }
        order
    }

    /// Allocate `count` contiguous units from a single group, first-fit.
    pub fn allocate(
        &mut self,
        inode: &mut Dinode,
        count: u32,
        hint: AllocHint,
    ) -> Result<Allocation> {
        if count == 0 {
            return Err(O2Error::InvalidArgument("cannot allocate 0 bits".into()));
        }
        for idx in self.search_order(inode, hint) {
            let group = &self.groups[idx];
            if u32::from(group.desc.free_bits_count) < count {
                continue;
            }
            let want = usize::try_from(count).unwrap_or(usize::MAX);
            let Some(offset) =
                bitops::find_clear_run(&group.desc.bitmap, usize::from(group.desc.bits), want)
            else {
                continue;
            };
            let group = &mut self.groups[idx];
            for bit in offset..offset + want {
                bitops::set_bit(&mut group.desc.bitmap, bit);
            }
            let start = group.start_unit + u64::try_from(offset).unwrap_or(u64::MAX);
            let allocation = Allocation {
                start,
                count,
                group: group.desc.blkno,
                chain: group.desc.chain,
            };
            adjust_counts(&mut self.groups[idx], inode, -i64::from(count))?;
            self.dirty = true;
            debug!(
                inode = self.owner,
                start,
                count,
                group = allocation.group,
                "chain_alloc"
            );
            return Ok(allocation);
        }
        debug!(inode = self.owner, count, "chain_alloc_no_space");
        Err(O2Error::NoSpace)
    }

    fn group_for(&self, unit: u64, count: u64) -> Result<usize> {
        self.groups
            .iter()
            .position(|g| g.contains(unit, count))
            .ok_or_else(|| {
                O2Error::InvalidArgument(format!(
                    "units {unit}..+{count} are not covered by a single group of allocator {}",
                    self.owner
                ))
            })
    }

    /// Release `count` units starting at `start`.
    ///
    /// Every bit must currently be set; otherwise nothing changes and
    /// `FreeingUnallocated` names the first clear unit.
    pub fn free(&mut self, inode: &mut Dinode, start: u64, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let idx = self.group_for(start, u64::from(count))?;
        let group = &mut self.groups[idx];
        let offset = group.offset_of(start);
        let len = usize::try_from(count).unwrap_or(usize::MAX);
        if let Some(bit) = (offset..offset + len).find(|&bit| !bitops::test_bit(&group.desc.bitmap, bit)) {
            let unit = group.start_unit + u64::try_from(bit).unwrap_or(u64::MAX);
            return Err(O2Error::FreeingUnallocated { unit });
        }
        for bit in offset..offset + len {
            bitops::clear_bit(&mut group.desc.bitmap, bit);
        }
        adjust_counts(group, inode, i64::from(count))?;
        self.dirty = true;
        debug!(inode = self.owner, start, count, "chain_free");
        Ok(())
    }

    /// Whether `unit` is allocated.
    pub fn test(&self, unit: u64) -> Result<bool> {
        let group = &self.groups[self.group_for(unit, 1)?];
        Ok(bitops::test_bit(&group.desc.bitmap, group.offset_of(unit)))
    }

    /// True when every unit of `start..start + count` is free. Ranges that
    /// cross groups are checked unit by unit.
    pub fn is_range_free(&self, start: u64, count: u64) -> Result<bool> {
        for unit in start..start + count {
            if self.test(unit)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Mark one unit allocated regardless of its state, returning the
    /// previous value. Counters only move when the bit changes.
    pub fn force_allocated(&mut self, inode: &mut Dinode, unit: u64) -> Result<bool> {
        let idx = self.group_for(unit, 1)?;
        let group = &mut self.groups[idx];
        let offset = group.offset_of(unit);
        let old = bitops::set_bit(&mut group.desc.bitmap, offset);
        if !old {
            adjust_counts(group, inode, -1)?;
            self.dirty = true;
        }
        Ok(old)
    }

    /// Write every modified group descriptor. The inode itself is written
    /// by its owner. Returns the number of blocks written.
    pub fn write(&mut self, dev: &dyn BlockDevice) -> Result<usize> {
        let mut written = 0;
        for group in self.groups.iter_mut().filter(|g| g.dirty) {
            group
                .desc
                .encode_into(&mut group.raw)
                .map_err(|err| O2Error::Corruption {
                    block: group.desc.blkno,
                    detail: err.to_string(),
                })?;
            dev.write_block(BlockNumber(group.desc.blkno), &group.raw)?;
            group.dirty = false;
            written += 1;
        }
        self.dirty = false;
        debug!(inode = self.owner, written, "chain_allocator_written");
        Ok(written)
    }
}

/// Apply a free-count delta to the group, its chain record, and the inode's
/// used counter.
fn adjust_counts(group: &mut Group, inode: &mut Dinode, delta: i64) -> Result<()> {
    let owner = inode.blkno;
    let overflow = |what: &str| O2Error::Corruption {
        block: owner,
        detail: format!("{what} counter out of range"),
    };
    let free = i64::from(group.desc.free_bits_count) + delta;
    group.desc.free_bits_count = u16::try_from(free).map_err(|_| overflow("group free"))?;
    group.dirty = true;

    let chain = usize::from(group.desc.chain);
    let rec = inode
        .chain_list_mut()
        .and_then(|cl| cl.recs.get_mut(chain))
        .ok_or_else(|| overflow("chain record"))?;
    rec.free = u32::try_from(i64::from(rec.free) + delta).map_err(|_| overflow("chain free"))?;

    let used = i64::from(inode.bitmap_used()) - delta;
    let total = inode.bitmap_total();
    inode.set_bitmap_counts(
        u32::try_from(used).map_err(|_| overflow("inode used"))?,
        total,
    );
    Ok(())
}

/// Build a fresh group descriptor with bit 0 set for the descriptor block
/// itself.
pub fn init_group_desc(
    block_size: usize,
    blkno: u64,
    generation: u32,
    parent_inode: u64,
    bits: u16,
    chain: u16,
) -> Result<GroupDesc> {
    let size = group_bitmap_size(block_size);
    if bits == 0 || usize::from(bits) > usize::from(size) * 8 {
        return Err(O2Error::InvalidArgument(format!(
            "group of {bits} bits does not fit a {size}-byte bitmap"
        )));
    }
    let mut bitmap = vec![0_u8; usize::from(size)];
    bitops::set_bit(&mut bitmap, 0);
    Ok(GroupDesc {
        size,
        bits,
        free_bits_count: bits - 1,
        chain,
        generation,
        next_group: 0,
        parent_dinode: parent_inode,
        blkno,
        bitmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use o2_block::{ByteBlockDevice, MemoryByteDevice};
    use o2_ondisk::{ChainList, ChainRec, InodeFlags, InodePayload, chain_recs_per_inode, new_dinode};

    const BS: usize = 512;

    fn geom() -> Geometry {
        Geometry::new(9, 12, 512).expect("geometry")
    }

    fn device() -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(MemoryByteDevice::new(BS * 512), 512).expect("device")
    }

    fn put_group(dev: &dyn BlockDevice, desc: &GroupDesc) {
        let mut raw = vec![0_u8; BS];
        desc.encode_into(&mut raw).expect("encode group");
        dev.write_block(BlockNumber(desc.blkno), &raw).expect("write group");
    }

    /// Block allocator (one bit per block) with three 64-bit groups:
    /// chain 0 holds groups at 64 and 128, chain 1 holds the group at 192.
    fn fixture() -> (ByteBlockDevice<MemoryByteDevice>, Dinode) {
        let dev = device();
        let mut a = init_group_desc(BS, 64, 1, 10, 64, 0).expect("group a");
        a.next_group = 128;
        let b = init_group_desc(BS, 128, 1, 10, 64, 0).expect("group b");
        let c = init_group_desc(BS, 192, 1, 10, 64, 1).expect("group c");
        for g in [&a, &b, &c] {
            put_group(&dev, g);
        }

        let mut inode = new_dinode(BS, 10, 0o100_644, 1);
        inode.flags = InodeFlags::VALID.with(InodeFlags::SYSTEM).with(InodeFlags::CHAIN);
        inode.id2 = InodePayload::Chain(ChainList {
            cpg: 8,
            bpc: 8,
            count: chain_recs_per_inode(BS),
            recs: vec![
                ChainRec { free: 126, total: 128, blkno: 64 },
                ChainRec { free: 63, total: 64, blkno: 192 },
            ],
        });
        inode.set_bitmap_counts(3, 192);
        (dev, inode)
    }

    fn chain_free(inode: &Dinode, chain: usize) -> u32 {
        inode.chain_list().expect("chain list").recs[chain].free
    }

    #[test]
    fn init_group_reserves_descriptor_bit() {
        let g = init_group_desc(BS, 64, 3, 10, 100, 2).expect("init");
        assert_eq!(g.size, group_bitmap_size(BS));
        assert_eq!(g.free_bits_count, 99);
        assert!(bitops::test_bit(&g.bitmap, 0));
        assert!(!bitops::test_bit(&g.bitmap, 1));
        assert_eq!(g.chain, 2);
        assert!(init_group_desc(BS, 64, 3, 10, 0, 0).is_err());
        assert!(init_group_desc(BS, 64, 3, 10, u16::MAX, 0).is_err());
    }

    #[test]
    fn start_unit_scaling() {
        let g = geom();
        // 512-byte units on 512-byte blocks.
        assert_eq!(scale_start_bit(g, 192, 8), 192);
        // Cluster-sized units: eight blocks per unit.
        assert_eq!(scale_start_bit(g, 192, 1), 24);
        let small = Geometry::new(12, 12, 64).expect("geometry");
        // 1K units on 4K blocks.
        assert_eq!(scale_start_bit(small, 5, 4), 20);
    }

    #[test]
    fn load_reports_groups_in_chain_order() {
        let (dev, inode) = fixture();
        let alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        let groups = alloc.groups();
        assert_eq!(
            groups.iter().map(|g| g.blkno).collect::<Vec<_>>(),
            vec![64, 128, 192]
        );
        assert_eq!(alloc.free_units(), 189);
        assert_eq!(alloc.total_units(), 192);
        alloc.verify(&inode).expect("consistent");
    }

    #[test]
    fn first_cluster_group_starts_at_zero() {
        let (dev, inode) = fixture();
        let alloc = ChainAllocator::load(&dev, geom(), &inode, 64).expect("load");
        assert_eq!(alloc.groups()[0].start_unit, 0);
        assert!(alloc.test(0).expect("test"));
        assert!(!alloc.test(1).expect("test"));
    }

    #[test]
    fn chain_free_mismatch_is_corruption() {
        let (dev, mut inode) = fixture();
        inode.chain_list_mut().expect("chains").recs[1].free = 10;
        let err = ChainAllocator::load(&dev, geom(), &inode, 0).expect_err("mismatch");
        assert!(matches!(err, O2Error::Corruption { block: 10, .. }));
    }

    #[test]
    fn wrong_bitmap_size_is_corruption() {
        let (dev, inode) = fixture();
        let mut c = init_group_desc(BS, 192, 1, 10, 64, 1).expect("group");
        c.size = 64;
        c.bitmap.truncate(64);
        put_group(&dev, &c);
        let err = ChainAllocator::load(&dev, geom(), &inode, 0).expect_err("size");
        assert!(matches!(err, O2Error::Corruption { block: 192, .. }));
    }

    #[test]
    fn allocate_updates_every_counter() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        let got = alloc
            .allocate(&mut inode, 4, AllocHint::default())
            .expect("allocate");
        assert_eq!(
            got,
            Allocation { start: 65, count: 4, group: 64, chain: 0 }
        );
        assert_eq!(chain_free(&inode, 0), 122);
        assert_eq!(inode.bitmap_used(), 7);
        assert_eq!(inode.bitmap_total(), 192);
        assert!(alloc.is_dirty());
        for unit in 65..69 {
            assert!(alloc.test(unit).expect("test"));
        }
        alloc.verify(&inode).expect("consistent");
    }

    #[test]
    fn chain_hint_picks_starting_chain() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        let hint = AllocHint { chain: Some(1), group: None };
        let got = alloc.allocate(&mut inode, 2, hint).expect("allocate");
        assert_eq!(got.group, 192);
        assert_eq!(got.start, 193);
        assert_eq!(chain_free(&inode, 1), 61);
        assert_eq!(chain_free(&inode, 0), 126);

        let hint = AllocHint { chain: None, group: Some(128) };
        let got = alloc.allocate(&mut inode, 1, hint).expect("allocate");
        assert_eq!(got.start, 129);
    }

    #[test]
    fn requests_never_split_across_groups() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        // 189 units free in total, but the largest run is 63.
        let err = alloc
            .allocate(&mut inode, 64, AllocHint::default())
            .expect_err("too long");
        assert!(matches!(err, O2Error::NoSpace));
        assert_eq!(inode.bitmap_used(), 3);
        assert!(!alloc.is_dirty());

        let got = alloc
            .allocate(&mut inode, 63, AllocHint::default())
            .expect("whole group");
        assert_eq!(got.start, 65);
        let got = alloc
            .allocate(&mut inode, 63, AllocHint::default())
            .expect("next group");
        assert_eq!(got.group, 128);
    }

    #[test]
    fn zero_length_request_is_rejected() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        assert!(matches!(
            alloc.allocate(&mut inode, 0, AllocHint::default()),
            Err(O2Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn free_restores_counters() {
        let (dev, mut inode) = fixture();
        let before = inode.clone();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        let got = alloc
            .allocate(&mut inode, 10, AllocHint::default())
            .expect("allocate");
        alloc.free(&mut inode, got.start, got.count).expect("free");
        assert_eq!(inode, before);
        assert!(alloc.is_range_free(got.start, 10).expect("range"));
        alloc.verify(&inode).expect("consistent");
    }

    #[test]
    fn double_free_is_detected_before_mutation() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        let got = alloc
            .allocate(&mut inode, 2, AllocHint::default())
            .expect("allocate");
        let snapshot = inode.clone();
        // Unit 67 was never allocated.
        let err = alloc.free(&mut inode, got.start, 3).expect_err("partly clear");
        assert!(matches!(err, O2Error::FreeingUnallocated { unit: 67 }));
        assert_eq!(inode, snapshot);
        assert!(alloc.test(got.start).expect("still set"));
    }

    #[test]
    fn free_outside_groups_is_invalid() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        assert!(matches!(
            alloc.free(&mut inode, 10, 1),
            Err(O2Error::InvalidArgument(_))
        ));
        // Straddles groups at 64 and 128.
        assert!(matches!(
            alloc.free(&mut inode, 120, 16),
            Err(O2Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn force_allocated_counts_once() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        assert!(!alloc.force_allocated(&mut inode, 200).expect("mark"));
        assert!(alloc.force_allocated(&mut inode, 200).expect("mark again"));
        assert_eq!(chain_free(&inode, 1), 62);
        assert_eq!(inode.bitmap_used(), 4);
    }

    #[test]
    fn written_groups_reload_identically() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        alloc
            .allocate(&mut inode, 5, AllocHint { chain: Some(1), group: None })
            .expect("allocate");
        assert_eq!(alloc.write(&dev).expect("write"), 1);
        assert!(!alloc.is_dirty());
        assert_eq!(alloc.write(&dev).expect("nothing dirty"), 0);

        let reloaded = ChainAllocator::load(&dev, geom(), &inode, 0).expect("reload");
        assert_eq!(reloaded.groups(), alloc.groups());
        reloaded.verify(&inode).expect("consistent");
    }

    #[test]
    fn chain_counts_are_conserved_over_mixed_operations() {
        let (dev, mut inode) = fixture();
        let mut alloc = ChainAllocator::load(&dev, geom(), &inode, 0).expect("load");
        let mut live = Vec::new();
        for round in 0_u32..40 {
            let count = round % 7 + 1;
            let hint = AllocHint { chain: Some(u16::try_from(round % 2).expect("chain")), group: None };
            if let Ok(a) = alloc.allocate(&mut inode, count, hint) {
                live.push(a);
            }
            if round % 3 == 0 && !live.is_empty() {
                let a = live.remove(live.len() / 2);
                alloc.free(&mut inode, a.start, a.count).expect("free");
            }
            alloc.verify(&inode).expect("consistent");
            let used: u32 = live.iter().map(|a| a.count).sum::<u32>() + 3;
            assert_eq!(inode.bitmap_used(), used);
        }
    }
}
