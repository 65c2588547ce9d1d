//! Filesystem handle: superblock validation, system inode discovery, and
//! close-time writeback.

use crate::inode::CachedInode;
use crate::sysfile::{SystemFile, SystemInode, SystemInodes};
use crate::{corrupt, parse_to_o2_error};
use o2_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice};
use o2_dir::{DirAction, IterFlags};
use o2_error::{O2Error, Result};
use o2_ondisk::inode::SUPER_BLOCK_SIGNATURE;
use o2_ondisk::{CompatFeatures, Dinode, FeatureDiagnostics, IncompatFeatures, InodeFlags, InodePayload, Superblock};
use o2_types::{BlockNumber, Geometry, PROBE_BLOCK_SIZES, SUPERBLOCK_BLKNO};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling how a volume is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Allow writes. Opening a read-only device this way fails with
    /// `ReadOnly`.
    pub writable: bool,
    /// Block size to use instead of probing 512..=4096.
    pub block_size: Option<u32>,
    /// Do not read the system directory. Operations that need a system
    /// inode then fail with `NotFound`.
    pub skip_system_inodes: bool,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    #[must_use]
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    #[must_use]
    pub fn skip_system_inodes(mut self, skip: bool) -> Self {
        self.skip_system_inodes = skip;
        self
    }
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// An open volume.
///
/// Owns the device, the decoded superblock, the system inode table, and
/// the one in-memory copy of each system allocator. Dropping the handle
/// without [`Filesystem::close`] discards unwritten superblock and
/// allocator changes.
pub struct Filesystem {
    dev: Box<dyn BlockDevice>,
    geom: Geometry,
    super_inode: Dinode,
    super_raw: Vec<u8>,
    sb: Superblock,
    super_dirty: bool,
    writable: bool,
    system: SystemInodes,
    allocators: Mutex<BTreeMap<AllocatorKey, CachedInode>>,
}

pub(crate) type AllocatorKey = (SystemFile, Option<u16>);

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("geometry", &self.geom)
            .field("label", &self.sb.label_str())
            .field("writable", &self.writable)
            .field("super_dirty", &self.super_dirty)
            .field("system_inodes", &self.system.len())
            .field("cached_allocators", &self.allocators.lock().len())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Open the image or device at `path`.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let dev = if options.writable {
            FileByteDevice::open(path)?
        } else {
            FileByteDevice::open_read_only(path)?
        };
        debug!(path = %path.display(), writable = options.writable, "open_path");
        Self::open_device(Arc::new(dev), options)
    }

    /// Open a byte device, probing for the superblock block size unless
    /// `options.block_size` pins it.
    pub fn open_device(dev: Arc<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let sizes: Vec<u32> = options
            .block_size
            .map_or_else(|| PROBE_BLOCK_SIZES.to_vec(), |bs| vec![bs]);
        for bs in sizes {
            if dev.len_bytes() < (SUPERBLOCK_BLKNO + 1) * u64::from(bs) {
                continue;
            }
            let block_dev = ByteBlockDevice::new(Arc::clone(&dev), bs)?;
            let raw = block_dev.read_block(BlockNumber(SUPERBLOCK_BLKNO))?;
            if superblock_matches(raw.as_slice(), bs) {
                debug!(block_size = bs, "superblock_signature_found");
                return Self::open_block_device(Box::new(block_dev), options);
            }
        }
        Err(corrupt(SUPERBLOCK_BLKNO, "no superblock signature at any candidate block size"))
    }

    /// Open a device whose block size already matches the volume's.
    pub fn open_block_device(dev: Box<dyn BlockDevice>, options: &OpenOptions) -> Result<Self> {
        let raw = dev.read_block(BlockNumber(SUPERBLOCK_BLKNO))?.into_inner();
        if !raw.starts_with(SUPER_BLOCK_SIGNATURE) {
            return Err(corrupt(SUPERBLOCK_BLKNO, "bad superblock signature"));
        }
        let super_inode =
            Dinode::parse(&raw).map_err(|err| parse_to_o2_error(SUPERBLOCK_BLKNO, &err))?;
        let sb = match &super_inode.id2 {
            InodePayload::Super(sb) if super_inode.flags.contains(InodeFlags::SUPER_BLOCK) => {
                sb.as_ref().clone()
            }
            _ => return Err(corrupt(SUPERBLOCK_BLKNO, "superblock inode lacks SUPER_BLOCK flag")),
        };
        if sb.block_size() != u64::from(dev.block_size()) {
            return Err(corrupt(
                SUPERBLOCK_BLKNO,
                format!(
                    "superblock records block size {} but device uses {}",
                    sb.block_size(),
                    dev.block_size()
                ),
            ));
        }

        let diagnostics = sb.feature_diagnostics();
        if !diagnostics.is_ok() {
            return Err(O2Error::UnsupportedFeature(diagnostics.to_string()));
        }
        if options.writable && diagnostics.unknown_ro_compat_bits != 0 {
            debug!(bits = diagnostics.unknown_ro_compat_bits, "ro_compat_refuses_write");
            return Err(O2Error::UnsupportedFeature(format!(
                "unknown ro_compat bits 0x{:X} allow read-only access only",
                diagnostics.unknown_ro_compat_bits
            )));
        }

        let geom = volume_geometry(&sb, &super_inode, dev.block_count())?;
        if options.writable && !dev.is_writable() {
            return Err(O2Error::ReadOnly);
        }

        let mut fs = Self {
            dev,
            geom,
            super_inode,
            super_raw: raw,
            sb,
            super_dirty: false,
            writable: options.writable,
            system: SystemInodes::default(),
            allocators: Mutex::new(BTreeMap::new()),
        };
        if !options.skip_system_inodes {
            fs.system = fs.load_system_inodes()?;
        }
        debug!(
            block_size = fs.geom.block_size(),
            cluster_size = fs.geom.cluster_size(),
            blocks = fs.geom.block_count(),
            max_slots = fs.sb.max_slots,
            system_inodes = fs.system.len(),
            writable = fs.writable,
            "open"
        );
        Ok(fs)
    }

    fn load_system_inodes(&self) -> Result<SystemInodes> {
        let sysdir = self.sb.system_dir_blkno;
        let mut table = SystemInodes::default();
        self.dir_iterate(sysdir, IterFlags::default().without_dots(), |entry, _| {
            if let Some((file, slot)) = SystemFile::parse_name(&entry.name) {
                table.insert(SystemInode {
                    file,
                    slot,
                    blkno: entry.inode,
                });
            }
            Ok(DirAction::Continue)
        })?;
        Ok(table)
    }

    /// Write back dirty allocators and a dirty superblock (and its
    /// backups), then sync.
    ///
    /// The handle is consumed whether or not the writeback succeeds; a
    /// failure is still returned.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        if let Err(err) = &result {
            warn!(error = %err, "close_flush_failed");
        }
        let allocators = std::mem::take(self.allocators.get_mut());
        debug!(dirty = self.super_dirty, allocators = allocators.len(), "close");
        result
    }

    /// Write back dirty allocators and a dirty superblock, then sync the
    /// device.
    pub fn flush(&mut self) -> Result<()> {
        self.write_allocators()?;
        if self.super_dirty {
            self.write_super()?;
        }
        if self.writable {
            self.dev.sync()?;
        }
        Ok(())
    }

    /// Encode the in-memory superblock to block 2, refreshing backup copies
    /// when the volume carries them.
    pub fn write_super(&mut self) -> Result<()> {
        self.check_writable()?;
        self.super_inode.id2 = InodePayload::Super(Box::new(self.sb.clone()));
        self.super_inode
            .encode_into(&mut self.super_raw)
            .map_err(|err| parse_to_o2_error(SUPERBLOCK_BLKNO, &err))?;
        self.dev
            .write_block(BlockNumber(SUPERBLOCK_BLKNO), &self.super_raw)?;
        if self.sb.feature_compat.contains(CompatFeatures::BACKUP_SB) {
            let backups = self.backup_super_blocks();
            self.refresh_backup_super(&backups)?;
        }
        self.super_dirty = false;
        debug!("write_super");
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geom
    }

    #[must_use]
    pub fn block_len(&self) -> usize {
        self.geom.block_len()
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Mutable superblock access; marks it for writeback on close.
    pub fn superblock_mut(&mut self) -> &mut Superblock {
        self.super_dirty = true;
        &mut self.sb
    }

    #[must_use]
    pub fn super_inode(&self) -> &Dinode {
        &self.super_inode
    }

    pub(crate) fn allocator_cache(&self) -> &Mutex<BTreeMap<AllocatorKey, CachedInode>> {
        &self.allocators
    }

    pub(crate) fn super_raw(&self) -> &[u8] {
        &self.super_raw
    }

    #[must_use]
    pub fn is_superblock_dirty(&self) -> bool {
        self.super_dirty
    }

    #[must_use]
    pub fn feature_diagnostics(&self) -> FeatureDiagnostics {
        self.sb.feature_diagnostics()
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn root_blkno(&self) -> u64 {
        self.sb.root_blkno
    }

    #[must_use]
    pub fn system_dir_blkno(&self) -> u64 {
        self.sb.system_dir_blkno
    }

    #[must_use]
    pub fn system_inodes(&self) -> &SystemInodes {
        &self.system
    }

    /// Block number of a system file; absent entries are `NotFound`.
    pub fn system_inode(&self, file: SystemFile, slot: Option<u16>) -> Result<u64> {
        self.system.get(file, slot).ok_or_else(|| {
            let name = file
                .file_name(slot)
                .unwrap_or_else(|| format!("{file}:<slot>"));
            O2Error::NotFound(format!("system inode {name}"))
        })
    }

    /// Whether directory blocks end in a trailer.
    #[must_use]
    pub fn dir_blocks_have_trailer(&self) -> bool {
        self.sb
            .feature_incompat
            .intersects(IncompatFeatures::META_ECC.with(IncompatFeatures::INDEXED_DIRS))
    }

    // ── Block I/O ──────────────────────────────────────────────────────────

    pub fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(O2Error::ReadOnly)
        }
    }

    pub fn read_block(&self, blkno: u64) -> Result<Vec<u8>> {
        Ok(self.dev.read_block(BlockNumber(blkno))?.into_inner())
    }

    pub fn write_block(&self, blkno: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.dev.write_block(BlockNumber(blkno), data)
    }

    /// Reject inode block numbers before the superblock or past the volume.
    pub fn check_inode_blkno(&self, blkno: u64) -> Result<()> {
        if blkno < SUPERBLOCK_BLKNO || blkno >= self.geom.block_count() {
            return Err(O2Error::InvalidArgument(format!(
                "inode block {blkno} outside {SUPERBLOCK_BLKNO}..{}",
                self.geom.block_count()
            )));
        }
        Ok(())
    }

    /// Read and decode an inode block, returning the raw block as well.
    pub fn read_inode_raw(&self, blkno: u64) -> Result<(Dinode, Vec<u8>)> {
        self.check_inode_blkno(blkno)?;
        let raw = self.read_block(blkno)?;
        let inode = Dinode::parse(&raw).map_err(|err| parse_to_o2_error(blkno, &err))?;
        if inode.blkno != blkno {
            return Err(corrupt(
                blkno,
                format!("inode records block number {}", inode.blkno),
            ));
        }
        Ok((inode, raw))
    }

    pub fn read_inode(&self, blkno: u64) -> Result<Dinode> {
        self.read_inode_raw(blkno).map(|(inode, _)| inode)
    }
}

fn superblock_matches(raw: &[u8], block_size: u32) -> bool {
    raw.starts_with(SUPER_BLOCK_SIGNATURE)
        && Superblock::parse(raw).is_ok_and(|sb| sb.block_size() == u64::from(block_size))
}

/// Geometry from the superblock, bounded by the device size.
fn volume_geometry(sb: &Superblock, super_inode: &Dinode, device_blocks: u64) -> Result<Geometry> {
    let sb_geom = Geometry::new(sb.blocksize_bits, sb.clustersize_bits, device_blocks)
        .map_err(|err| O2Error::InvalidGeometry(err.to_string()))?;
    let volume_blocks = sb_geom.clusters_to_blocks(u64::from(super_inode.clusters));
    if volume_blocks == 0 {
        return Err(corrupt(SUPERBLOCK_BLKNO, "superblock records zero clusters"));
    }
    if volume_blocks > device_blocks {
        return Err(O2Error::InvalidGeometry(format!(
            "volume spans {volume_blocks} blocks but the device holds {device_blocks}"
        )));
    }
    Geometry::new(sb.blocksize_bits, sb.clustersize_bits, volume_blocks)
        .map_err(|err| O2Error::InvalidGeometry(err.to_string()))
}
