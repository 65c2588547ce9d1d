//! Synthetic volume builder for integration tests.
//!
//! Layout: the superblock at block 2; the first global bitmap group at the
//! next cluster boundary; a fixed inode area from the cluster after that;
//! data clusters are handed out in order after that. The bitmap, its chain
//! records, and the superblock are written by [`TestVolume::finish`].

#![allow(dead_code)]

use o2_alloc::{bitops, init_group_desc};
use o2_block::{BlockDevice, ByteBlockDevice, ByteDevice, MemoryByteDevice};
use o2_dir::Region;
use o2_ondisk::inode::{S_IFDIR, S_IFLNK, S_IFREG, SUPER_BLOCK_SIGNATURE, signature8};
use o2_ondisk::{
    ChainList, ChainRec, CompatFeatures, Dinode, ExtentRec, FileType, GroupDesc,
    IncompatFeatures, InodeFlags, InodePayload, RoCompatFeatures, Superblock,
    chain_recs_per_inode, group_bitmap_size, new_dinode,
};
use o2_error::O2Error;
use o2_types::BlockNumber;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const FS_GENERATION: u32 = 0x0102_0304;
const INODE_AREA_BLOCKS: u64 = 64;

#[derive(Debug, Clone, Copy)]
pub struct VolumeSpec {
    pub blocksize_bits: u32,
    pub clustersize_bits: u32,
    pub clusters: u32,
    pub max_slots: u16,
    pub compat: u32,
    pub incompat: u32,
    pub ro_compat: u32,
    /// Bits in the first bitmap group; defaults to every cluster that fits.
    pub group_bits: Option<u16>,
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            blocksize_bits: 9,
            clustersize_bits: 12,
            clusters: 256,
            max_slots: 2,
            compat: 0,
            incompat: 0,
            ro_compat: 0,
            group_bits: None,
        }
    }
}

pub struct TestVolume {
    pub spec: VolumeSpec,
    pub bs: usize,
    pub bpc: u64,
    pub dev: Arc<dyn ByteDevice>,
    pub root: u64,
    pub sysdir: u64,
    pub global_bitmap: u64,
    first_group: u64,
    group_bits: u16,
    bitmap: Vec<u8>,
    extra_groups: Vec<GroupDesc>,
    next_inode: u64,
    inode_end: u64,
    next_cluster: u64,
}

impl TestVolume {
    /// In-memory volume.
    pub fn new(spec: VolumeSpec) -> Self {
        let bytes = u64::from(spec.clusters) << spec.clustersize_bits;
        let dev = MemoryByteDevice::new(usize::try_from(bytes).expect("volume fits memory"));
        Self::on_device(spec, Arc::new(dev))
    }

    /// Volume laid out on an existing device of at least `clusters`
    /// clusters.
    pub fn on_device(spec: VolumeSpec, dev: Arc<dyn ByteDevice>) -> Self {
        let bs = 1_usize << spec.blocksize_bits;
        let bpc = 1_u64 << (spec.clustersize_bits - spec.blocksize_bits);
        let max_bits = usize::from(group_bitmap_size(bs)) * 8;
        let group_bits = spec.group_bits.unwrap_or_else(|| {
            u16::try_from(usize::try_from(spec.clusters).expect("usize").min(max_bits))
                .expect("group bits")
        });
        let first_group = 3_u64.div_ceil(bpc) * bpc;
        let inode_start = first_group + bpc;
        let inode_end = inode_start + INODE_AREA_BLOCKS;
        let mut vol = Self {
            spec,
            bs,
            bpc,
            dev,
            root: 0,
            sysdir: 0,
            global_bitmap: 0,
            first_group,
            group_bits,
            bitmap: vec![0_u8; usize::from(group_bitmap_size(bs))],
            extra_groups: Vec::new(),
            next_inode: inode_start,
            inode_end,
            next_cluster: inode_end.div_ceil(bpc),
        };
        for cluster in 0..vol.next_cluster {
            vol.mark_cluster(cluster);
        }

        vol.sysdir = vol.alloc_inode();
        let sysdir = vol.sysdir;
        vol.make_dir_inode(sysdir, sysdir, true);
        vol.root = vol.alloc_inode();
        let root = vol.root;
        vol.make_dir_inode(root, root, false);
        vol.global_bitmap = vol.alloc_inode();
        vol.link(sysdir, "global_bitmap", vol.global_bitmap, FileType::Regular);
        vol
    }

    pub fn block_dev(&self) -> ByteBlockDevice<Arc<dyn ByteDevice>> {
        ByteBlockDevice::new(Arc::clone(&self.dev), u32::try_from(self.bs).expect("bs"))
            .expect("block device")
    }

    pub fn read_block(&self, blkno: u64) -> Vec<u8> {
        self.block_dev()
            .read_block(BlockNumber(blkno))
            .expect("read block")
            .into_inner()
    }

    pub fn write_block(&self, blkno: u64, data: &[u8]) {
        self.block_dev()
            .write_block(BlockNumber(blkno), data)
            .expect("write block");
    }

    pub fn cluster_block(&self, cluster: u64) -> u64 {
        cluster * self.bpc
    }

    fn mark_cluster(&mut self, cluster: u64) {
        let bit = usize::try_from(cluster).expect("cluster");
        if bit < usize::from(self.group_bits) {
            bitops::set_bit(&mut self.bitmap, bit);
        }
    }

    /// Mark a cluster used in the first bitmap group without handing it out.
    pub fn reserve_cluster(&mut self, cluster: u64) {
        self.mark_cluster(cluster);
    }

    pub fn alloc_inode(&mut self) -> u64 {
        assert!(self.next_inode < self.inode_end, "inode area exhausted");
        let blkno = self.next_inode;
        self.next_inode += 1;
        blkno
    }

    pub fn alloc_clusters(&mut self, count: u64) -> u64 {
        let first = self.next_cluster;
        for cluster in first..first + count {
            self.mark_cluster(cluster);
        }
        self.next_cluster += count;
        assert!(self.next_cluster <= u64::from(self.group_bits), "data clusters exhausted");
        first
    }

    pub fn write_inode(&self, inode: &Dinode) {
        let mut raw = vec![0_u8; self.bs];
        inode.encode_into(&mut raw).expect("encode inode");
        self.write_block(inode.blkno, &raw);
    }

    pub fn read_inode(&self, blkno: u64) -> Dinode {
        Dinode::parse(&self.read_block(blkno)).expect("parse inode")
    }

    /// Inode with `data` in freshly allocated contiguous clusters.
    fn data_inode(&mut self, blkno: u64, mode: u16, data: &[u8]) -> Dinode {
        let cluster_len = self.bs * usize::try_from(self.bpc).expect("bpc");
        let clusters = data.len().div_ceil(cluster_len).max(1);
        let first = self.alloc_clusters(clusters as u64);
        let mut padded = data.to_vec();
        padded.resize(clusters * cluster_len, 0);
        for (i, chunk) in padded.chunks(self.bs).enumerate() {
            self.write_block(self.cluster_block(first) + i as u64, chunk);
        }
        let mut inode = new_dinode(self.bs, blkno, mode, FS_GENERATION);
        inode.size = data.len() as u64;
        let clusters = u32::try_from(clusters).expect("clusters");
        inode.clusters = clusters;
        inode.extent_list_mut().expect("extent list").recs.push(ExtentRec {
            cpos: 0,
            clusters,
            flags: 0,
            blkno: self.cluster_block(first),
        });
        inode
    }

    fn make_dir_inode(&mut self, blkno: u64, parent: u64, system: bool) {
        let mut inode = self.data_inode(blkno, S_IFDIR | 0o755, &[]);
        inode.size = self.bs as u64;
        inode.links_count = 2;
        if system {
            inode.flags = inode.flags.with(InodeFlags::SYSTEM);
        }
        let first = inode.extent_list().expect("extents").recs[0].blkno;
        let region = Region::block(first, self.bs, false);
        let mut block = vec![0_u8; self.bs];
        o2_dir::init_dot_entries(&mut block, &region, blkno, parent).expect("dots");
        self.write_block(first, &block);
        self.write_inode(&inode);
    }

    /// Blocks of a directory, in logical order, up to its size.
    pub fn dir_blocks(&self, dir: u64) -> Vec<u64> {
        let inode = self.read_inode(dir);
        let blocks = inode.size / self.bs as u64;
        let root = inode.extent_list().expect("extents").clone();
        let mut out = Vec::new();
        o2_extent::for_each_block(
            &self.block_dev(),
            geometry(&self.spec),
            &root,
            dir,
            |logical, physical| {
                if logical < blocks {
                    out.push(physical);
                }
                Ok(std::ops::ControlFlow::Continue(()))
            },
        )
        .expect("walk dir");
        out
    }

    pub fn link(&mut self, dir: u64, name: &str, ino: u64, file_type: FileType) {
        for blkno in self.dir_blocks(dir) {
            let mut block = self.read_block(blkno);
            let region = Region::block(blkno, self.bs, false);
            let outcome = o2_dir::insert_entry(&mut block, &region, ino, name.as_bytes(), file_type)
                .expect("insert");
            if outcome.changed {
                self.write_block(blkno, &block);
            }
            if outcome.placed.is_some() {
                return;
            }
        }
        panic!("directory {dir} has no room for {name}");
    }

    pub fn mkdir(&mut self, parent: u64, name: &str) -> u64 {
        let ino = self.alloc_inode();
        self.make_dir_inode(ino, parent, false);
        self.link(parent, name, ino, FileType::Directory);
        ino
    }

    pub fn add_file(&mut self, dir: u64, name: &str, data: &[u8]) -> u64 {
        let ino = self.alloc_inode();
        let inode = self.data_inode(ino, S_IFREG | 0o644, data);
        self.write_inode(&inode);
        self.link(dir, name, ino, FileType::Regular);
        ino
    }

    /// Symlink whose target lives in the inode.
    pub fn add_fast_symlink(&mut self, dir: u64, name: &str, target: &str) -> u64 {
        let ino = self.alloc_inode();
        let mut inode = new_dinode(self.bs, ino, S_IFLNK | 0o777, FS_GENERATION);
        inode.size = target.len() as u64;
        inode.id2 = InodePayload::FastSymlink(target.as_bytes().to_vec());
        self.write_inode(&inode);
        self.link(dir, name, ino, FileType::Symlink);
        ino
    }

    /// Symlink whose target lives in a data cluster.
    pub fn add_slow_symlink(&mut self, dir: u64, name: &str, target: &str) -> u64 {
        let ino = self.alloc_inode();
        let inode = self.data_inode(ino, S_IFLNK | 0o777, target.as_bytes());
        self.write_inode(&inode);
        self.link(dir, name, ino, FileType::Symlink);
        ino
    }

    /// Directory whose entries live in the inode.
    pub fn add_inline_dir(&mut self, parent: u64, name: &str) -> u64 {
        let ino = self.alloc_inode();
        let mut inode = new_dinode(self.bs, ino, S_IFDIR | 0o755, FS_GENERATION);
        let count = o2_ondisk::inode::max_inline_data(self.bs);
        let mut area = vec![0_u8; usize::from(count)];
        let region = Region::inline(ino, 0..area.len());
        o2_dir::init_dot_entries(&mut area, &region, ino, parent).expect("dots");
        inode.dyn_features = o2_ondisk::DynFeatures::INLINE_DATA;
        inode.size = u64::from(count);
        inode.links_count = 2;
        inode.id2 = InodePayload::Inline(o2_ondisk::InlineData { count, data: area });
        self.write_inode(&inode);
        self.link(parent, name, ino, FileType::Directory);
        ino
    }

    /// System file `name` in the system directory.
    pub fn add_system_inode(&mut self, name: &str, flags: InodeFlags, data: &[u8]) -> u64 {
        let ino = self.alloc_inode();
        let mut inode = self.data_inode(ino, S_IFREG | 0o644, data);
        inode.flags = inode.flags.with(InodeFlags::SYSTEM).with(flags);
        self.write_inode(&inode);
        let sysdir = self.sysdir;
        self.link(sysdir, name, ino, FileType::Regular);
        ino
    }

    pub fn add_journal(&mut self, slot: u16, data: &[u8]) -> u64 {
        self.add_system_inode(&format!("journal:{slot:04}"), InodeFlags::JOURNAL, data)
    }

    /// A second bitmap group on chain 1 whose descriptor sits at `blkno`.
    pub fn add_bitmap_group(&mut self, blkno: u64, bits: u16) {
        let desc = init_group_desc(self.bs, blkno, FS_GENERATION, 0, bits, 1).expect("group");
        self.extra_groups.push(desc);
    }

    /// Write the bitmap, its allocator inode, and the superblock.
    pub fn finish(self) -> Arc<dyn ByteDevice> {
        let bs = self.bs;
        let used = u16::try_from(bitops::count_set(&self.bitmap, usize::from(self.group_bits)))
            .expect("used");
        let group = GroupDesc {
            size: group_bitmap_size(bs),
            bits: self.group_bits,
            free_bits_count: self.group_bits - used,
            chain: 0,
            generation: FS_GENERATION,
            next_group: 0,
            parent_dinode: self.global_bitmap,
            blkno: self.first_group,
            bitmap: self.bitmap.clone(),
        };
        let mut recs = vec![ChainRec {
            free: u32::from(group.free_bits_count),
            total: u32::from(group.bits),
            blkno: group.blkno,
        }];
        self.put_group(&group);
        if let Some(first) = self.extra_groups.first() {
            recs.push(ChainRec {
                free: self.extra_groups.iter().map(|g| u32::from(g.free_bits_count)).sum(),
                total: self.extra_groups.iter().map(|g| u32::from(g.bits)).sum(),
                blkno: first.blkno,
            });
        }
        for (i, g) in self.extra_groups.iter().enumerate() {
            let mut g = g.clone();
            g.parent_dinode = self.global_bitmap;
            g.next_group = self.extra_groups.get(i + 1).map_or(0, |n| n.blkno);
            self.put_group(&g);
        }

        let total: u32 = recs.iter().map(|r| r.total).sum();
        let free: u32 = recs.iter().map(|r| r.free).sum();
        let mut bitmap = new_dinode(bs, self.global_bitmap, S_IFREG | 0o644, FS_GENERATION);
        bitmap.flags = InodeFlags::VALID
            .with(InodeFlags::SYSTEM)
            .with(InodeFlags::BITMAP)
            .with(InodeFlags::CHAIN);
        bitmap.clusters = self.spec.clusters;
        bitmap.size = u64::from(self.spec.clusters) << self.spec.clustersize_bits;
        bitmap.id2 = InodePayload::Chain(ChainList {
            cpg: self.group_bits,
            bpc: 1,
            count: chain_recs_per_inode(bs),
            recs,
        });
        bitmap.set_bitmap_counts(total - free, total);
        self.write_inode(&bitmap);

        let mut sb_inode = new_dinode(bs, 2, 0, FS_GENERATION);
        sb_inode.signature = signature8(SUPER_BLOCK_SIGNATURE);
        sb_inode.flags = InodeFlags::VALID
            .with(InodeFlags::SYSTEM)
            .with(InodeFlags::SUPER_BLOCK);
        sb_inode.clusters = self.spec.clusters;
        sb_inode.id2 = InodePayload::Super(Box::new(superblock(&self.spec, self.root, self.sysdir, self.first_group)));
        self.write_inode(&sb_inode);
        self.dev
    }

    fn put_group(&self, desc: &GroupDesc) {
        let mut raw = vec![0_u8; self.bs];
        desc.encode_into(&mut raw).expect("encode group");
        self.write_block(desc.blkno, &raw);
    }
}

pub fn geometry(spec: &VolumeSpec) -> o2_types::Geometry {
    let blocks = u64::from(spec.clusters) << (spec.clustersize_bits - spec.blocksize_bits);
    o2_types::Geometry::new(spec.blocksize_bits, spec.clustersize_bits, blocks).expect("geometry")
}

fn superblock(spec: &VolumeSpec, root: u64, sysdir: u64, first_group: u64) -> Superblock {
    let mut label = [0_u8; 64];
    label[..6].copy_from_slice(b"testfs");
    Superblock {
        major_rev_level: 0,
        minor_rev_level: 90,
        mnt_count: 0,
        max_mnt_count: 20,
        state: 0,
        errors: 0,
        checkinterval: 0,
        lastcheck: 0,
        creator_os: 0,
        feature_compat: CompatFeatures(spec.compat),
        feature_incompat: IncompatFeatures(spec.incompat),
        feature_ro_compat: RoCompatFeatures(spec.ro_compat),
        root_blkno: root,
        system_dir_blkno: sysdir,
        blocksize_bits: spec.blocksize_bits,
        clustersize_bits: spec.clustersize_bits,
        max_slots: spec.max_slots,
        tunefs_flag: 0,
        uuid_hash: 0,
        first_cluster_group: first_group,
        label,
        uuid: [0xAB; 16],
    }
}

/// Byte device whose writes fail when they cover one chosen byte offset.
pub struct FailingWrites {
    inner: Arc<dyn ByteDevice>,
    fail_at: AtomicU64,
}

impl FailingWrites {
    pub fn new(inner: Arc<dyn ByteDevice>) -> Self {
        Self {
            inner,
            fail_at: AtomicU64::new(u64::MAX),
        }
    }

    /// Fail writes covering `offset`, or stop failing with `None`.
    pub fn fail_at(&self, offset: Option<u64>) {
        self.fail_at.store(offset.unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

impl ByteDevice for FailingWrites {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> o2_error::Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> o2_error::Result<()> {
        let target = self.fail_at.load(Ordering::SeqCst);
        if (offset..offset + buf.len() as u64).contains(&target) {
            return Err(O2Error::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.write_all_at(offset, buf)
    }

    fn sync(&self) -> o2_error::Result<()> {
        self.inner.sync()
    }
}
