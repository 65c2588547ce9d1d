mod common;

use common::{TestVolume, VolumeSpec};
use o2_core::{AllocHint, BlockNumber, CachedInode, Filesystem, O2Error, OpenOptions, SystemFile};
use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::BTreeSet;
use std::sync::Arc;

const GB: SystemFile = SystemFile::GlobalBitmap;

fn open_rw(vol: TestVolume) -> Filesystem {
    Filesystem::open_device(vol.finish(), &OpenOptions::new().writable(true)).expect("open volume")
}

/// The handle's cached bitmap, allocator loaded.
fn bitmap(fs: &Filesystem) -> CachedInode {
    fs.allocator_snapshot(GB, None).expect("bitmap")
}

/// The bitmap inode as it is on disk.
fn on_disk(fs: &Filesystem) -> CachedInode {
    CachedInode::read(fs, fs.system_inode(GB, None).expect("bitmap inode")).expect("read bitmap")
}

fn chain_free(ci: &CachedInode) -> u32 {
    ci.inode()
        .chain_list()
        .expect("chain list")
        .recs
        .iter()
        .map(|rec| rec.free)
        .sum()
}

/// Chain records, group descriptors, and the inode's used count agree.
fn assert_conserved(ci: &CachedInode) {
    let chain = ci.allocator().expect("allocator loaded");
    chain.verify(ci.inode()).expect("verify");
    let group_free: u64 = chain.groups().iter().map(|g| u64::from(g.free)).sum();
    assert_eq!(group_free, u64::from(chain_free(ci)));
    assert_eq!(chain.free_units(), group_free);
    assert_eq!(
        u64::from(ci.inode().bitmap_total() - ci.inode().bitmap_used()),
        group_free
    );
}

#[test]
fn exhausting_the_bitmap_reports_no_space() {
    let fs = open_rw(TestVolume::new(VolumeSpec::default()));
    let free = bitmap(&fs).allocator().expect("loaded").free_units();
    assert!(free > 0);

    let n = u32::try_from(free).expect("free fits u32");
    let alloc = fs.alloc_bits(GB, None, n, AllocHint::default()).expect("allocate all");
    assert_eq!(alloc.count, n);
    assert_eq!(chain_free(&bitmap(&fs)), 0);
    assert!(matches!(
        fs.alloc_bits(GB, None, 1, AllocHint::default()),
        Err(O2Error::NoSpace)
    ));
    assert_conserved(&bitmap(&fs));
    fs.write_allocator(GB, None).expect("write");

    let reread = on_disk(&fs);
    assert_eq!(chain_free(&reread), 0);
    assert_eq!(reread.inode().bitmap_used(), reread.inode().bitmap_total());
}

#[test]
fn allocation_is_first_fit_after_builder_clusters() {
    let mut vol = TestVolume::new(VolumeSpec::default());
    let first_data = vol.alloc_clusters(1);
    let fs = open_rw(vol);
    let a = fs.alloc_bits(GB, None, 3, AllocHint::default()).expect("alloc");
    assert_eq!(a.start, first_data + 1);
    let b = fs.alloc_bits(GB, None, 1, AllocHint::default()).expect("alloc");
    assert_eq!(b.start, a.start + 3);

    fs.free_bits(GB, None, a.start, 3).expect("free");
    let c = fs.alloc_bits(GB, None, 2, AllocHint::default()).expect("alloc");
    assert_eq!(c.start, a.start);
    assert_conserved(&bitmap(&fs));
}

#[test]
fn double_free_is_rejected_without_change() {
    let fs = open_rw(TestVolume::new(VolumeSpec::default()));
    let a = fs.alloc_bits(GB, None, 2, AllocHint::default()).expect("alloc");
    fs.free_bits(GB, None, a.start, 2).expect("free");
    let before = chain_free(&bitmap(&fs));
    let err = fs.free_bits(GB, None, a.start, 1).expect_err("double free");
    assert!(matches!(err, O2Error::FreeingUnallocated { unit } if unit == a.start));
    assert_eq!(chain_free(&bitmap(&fs)), before);
    assert_conserved(&bitmap(&fs));
}

#[test]
fn nothing_reaches_disk_before_write() {
    let fs = open_rw(TestVolume::new(VolumeSpec::default()));
    let before = chain_free(&on_disk(&fs));
    let a = fs.alloc_bits(GB, None, 4, AllocHint::default()).expect("alloc");
    assert_eq!(chain_free(&on_disk(&fs)), before);
    assert_eq!(chain_free(&bitmap(&fs)), before - 4);

    fs.write_allocator(GB, None).expect("write");
    assert_eq!(chain_free(&on_disk(&fs)), before - 4);
    assert!(fs.test_bit(GB, None, a.start).expect("test"));
    assert!(fs.test_bit(GB, None, a.start + 3).expect("test"));
    assert!(!fs.test_bit(GB, None, a.start + 4).expect("test"));

    // Discarding drops only what was never written.
    fs.alloc_bits(GB, None, 1, AllocHint::default()).expect("alloc");
    assert!(fs.discard_allocator(GB, None));
    assert!(!fs.discard_allocator(GB, None));
    assert_eq!(chain_free(&bitmap(&fs)), before - 4);
}

#[test]
fn force_bit_reports_previous_state() {
    let fs = open_rw(TestVolume::new(VolumeSpec::default()));
    let before = chain_free(&bitmap(&fs));
    assert!(fs.force_bit(GB, None, 0).expect("force used"));
    assert_eq!(chain_free(&bitmap(&fs)), before);
    assert!(!fs.force_bit(GB, None, 200).expect("force free"));
    assert_eq!(chain_free(&bitmap(&fs)), before - 1);
    assert!(fs.force_bit(GB, None, 200).expect("force again"));
    assert_conserved(&bitmap(&fs));
}

#[test]
fn units_outside_every_group_are_invalid() {
    let fs = open_rw(TestVolume::new(VolumeSpec::default()));
    assert!(fs.test_bit(GB, None, 10_000).is_err());
    assert!(matches!(
        fs.free_bits(GB, None, 250, 10),
        Err(O2Error::InvalidArgument(_))
    ));
}

#[test]
fn second_chain_is_used_when_first_is_full() {
    let spec = VolumeSpec {
        clusters: 512,
        group_bits: Some(256),
        ..VolumeSpec::default()
    };
    let mut vol = TestVolume::new(spec);
    // Cluster 256 holds a group covering clusters 256..512.
    let desc_blkno = vol.cluster_block(256);
    vol.add_bitmap_group(desc_blkno, 256);
    let fs = open_rw(vol);

    let groups = bitmap(&fs).allocator().expect("loaded").groups();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[1].start_unit, 256);
    assert_eq!(groups[1].free, 255);

    let first_free = u32::from(groups[0].free);
    fs.alloc_bits(GB, None, first_free, AllocHint::default()).expect("drain chain 0");
    let next = fs.alloc_bits(GB, None, 5, AllocHint::default()).expect("chain 1");
    assert_eq!(next.chain, 1);
    assert_eq!(next.start, 257);
    assert_eq!(next.group, desc_blkno);

    let hinted = fs
        .alloc_bits(GB, None, 1, AllocHint { chain: Some(1), group: None })
        .expect("hinted");
    assert_eq!(hinted.start, 262);
    assert_conserved(&bitmap(&fs));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn chain_counts_stay_conserved_across_mixed_operations(
        ops in proptest::collection::vec((any::<bool>(), 1_u32..8, any::<Index>()), 1..200),
    ) {
        let fs = open_rw(TestVolume::new(VolumeSpec::default()));
        let total = u64::from(bitmap(&fs).inode().bitmap_total());
        let used_at_open = total - bitmap(&fs).allocator().expect("loaded").free_units();
        let mut live: Vec<(u64, u32)> = Vec::new();

        for (round, (alloc, count, pick)) in ops.into_iter().enumerate() {
            if alloc || live.is_empty() {
                match fs.alloc_bits(GB, None, count, AllocHint::default()) {
                    Ok(a) => live.push((a.start, a.count)),
                    Err(O2Error::NoSpace) => {}
                    Err(err) => {
                        prop_assert!(false, "round {round}: {err}");
                    }
                }
            } else {
                let (start, count) = live.swap_remove(pick.index(live.len()));
                fs.free_bits(GB, None, start, count).expect("free live run");
            }
            if round % 50 == 49 {
                fs.write_allocator(GB, None).expect("write");
                prop_assert!(fs.discard_allocator(GB, None));
            }
            assert_conserved(&bitmap(&fs));
        }

        let live_units: u64 = live.iter().map(|&(_, c)| u64::from(c)).sum();
        let free = bitmap(&fs).allocator().expect("loaded").free_units();
        prop_assert_eq!(total - free, used_at_open + live_units);
    }
}

#[test]
fn close_writes_back_cached_allocations() {
    let vol = TestVolume::new(VolumeSpec::default());
    let dev = vol.finish();
    let fs = Filesystem::open_device(Arc::clone(&dev), &OpenOptions::new().writable(true)).expect("open");
    let a = fs.alloc_bits(GB, None, 1, AllocHint::default()).expect("alloc");
    fs.close().expect("close");

    let fs = Filesystem::open_device(dev, &OpenOptions::new()).expect("reopen");
    assert!(fs.test_bit(GB, None, a.start).expect("test"));
    assert!(matches!(
        fs.alloc_bits(GB, None, 1, AllocHint::default()),
        Err(O2Error::ReadOnly)
    ));
    assert!(matches!(fs.write_allocator(GB, None), Err(O2Error::ReadOnly)));
}

#[test]
fn directory_growth_and_callers_share_one_bitmap() {
    let mut vol = TestVolume::new(VolumeSpec::default());
    let root = vol.root;
    let target = vol.add_file(root, "target", b"x");
    let dev = vol.finish();
    let fs = Filesystem::open_device(Arc::clone(&dev), &OpenOptions::new().writable(true)).expect("open");

    // Held in the cache, not yet on disk, while the directory grows.
    let held = fs.alloc_bits(GB, None, 1, AllocHint::default()).expect("alloc");
    for i in 0..300 {
        let name = format!("n{i:04}");
        fs.link(root, name.as_bytes(), target, o2_core::FileType::Regular)
            .unwrap_or_else(|err| panic!("{name}: {err}"));
    }
    let geom = fs.geometry();
    let dir_clusters: BTreeSet<u64> = fs
        .read_inode(root)
        .expect("root")
        .extent_list()
        .expect("extents")
        .recs
        .iter()
        .flat_map(|rec| {
            let first = geom.block_to_cluster(BlockNumber(rec.blkno)).0;
            first..first + u64::from(rec.clusters)
        })
        .collect();
    assert_eq!(dir_clusters.len(), 2);
    assert!(!dir_clusters.contains(&held.start));

    let after = fs.alloc_bits(GB, None, 1, AllocHint::default()).expect("alloc");
    assert!(!dir_clusters.contains(&after.start), "cluster {} handed out twice", after.start);
    assert_ne!(after.start, held.start);
    assert_conserved(&bitmap(&fs));
    fs.close().expect("close");

    let fs = Filesystem::open_device(dev, &OpenOptions::new()).expect("reopen");
    for unit in dir_clusters.iter().copied().chain([held.start, after.start]) {
        assert!(fs.test_bit(GB, None, unit).expect("test"), "cluster {unit}");
    }
    assert_conserved(&bitmap(&fs));
}
