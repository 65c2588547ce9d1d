//! Backup superblocks.
//!
//! Copies live at fixed byte offsets (1G, 4G, 16G, 64G, 256G, 1T) that fall
//! inside the volume. Their clusters are marked used in the global bitmap
//! while the BACKUP_SB compat bit is set.

use crate::fs::Filesystem;
use crate::parse_to_o2_error;
use crate::sysfile::SystemFile;
use o2_error::{O2Error, Result};
use o2_ondisk::{CompatFeatures, InodePayload};
use o2_types::{BlockNumber, SUPERBLOCK_BLKNO};
use tracing::debug;

pub const MAX_BACKUP_SUPERBLOCKS: usize = 6;

const FIRST_BACKUP_BYTES: u64 = 1 << 30;

/// Block number of backup `index` for the given block size.
#[must_use]
pub fn backup_super_blkno(block_size: u64, index: usize) -> u64 {
    (FIRST_BACKUP_BYTES << (2 * index)) / block_size.max(1)
}

/// Backup locations that fit in a volume of `block_count` blocks.
#[must_use]
pub fn backup_super_offsets(block_size: u64, block_count: u64) -> Vec<u64> {
    (0..MAX_BACKUP_SUPERBLOCKS)
        .map(|i| backup_super_blkno(block_size, i))
        .take_while(|&blkno| blkno < block_count)
        .collect()
}

impl Filesystem {
    /// Backup locations for this volume.
    #[must_use]
    pub fn backup_super_blocks(&self) -> Vec<u64> {
        let geom = self.geometry();
        backup_super_offsets(u64::from(geom.block_size()), geom.block_count())
    }

    /// Write the current superblock to each of `blocks`, with the block
    /// number field rewritten to the copy's own location.
    pub fn refresh_backup_super(&self, blocks: &[u64]) -> Result<()> {
        self.check_writable()?;
        let mut inode = self.super_inode().clone();
        inode.id2 = InodePayload::Super(Box::new(self.superblock().clone()));
        for &blkno in blocks {
            let mut raw = self.super_raw().to_vec();
            inode.blkno = blkno;
            inode
                .encode_into(&mut raw)
                .map_err(|err| parse_to_o2_error(SUPERBLOCK_BLKNO, &err))?;
            self.device().write_block(BlockNumber(blkno), &raw)?;
        }
        debug!(copies = blocks.len(), "backup_super_refresh");
        Ok(())
    }

    /// Reserve and fill the clusters holding `blocks`.
    ///
    /// Unless the volume already carries backups, every target cluster
    /// must be free in the global bitmap; otherwise `NoSpace` and nothing
    /// is written.
    pub fn set_backup_super(&self, blocks: &[u64]) -> Result<()> {
        self.check_writable()?;
        if blocks.is_empty() {
            return Ok(());
        }
        let geom = self.geometry();
        let clusters: Vec<u64> = blocks
            .iter()
            .map(|&blkno| geom.block_to_cluster(BlockNumber(blkno)).0)
            .collect();
        if !self.superblock().feature_compat.contains(CompatFeatures::BACKUP_SB) {
            for &cluster in &clusters {
                if self.test_bit(SystemFile::GlobalBitmap, None, cluster)? {
                    debug!(cluster, "backup_super_cluster_in_use");
                    return Err(O2Error::NoSpace);
                }
            }
        }

        let zero = vec![0_u8; self.block_len()];
        for &cluster in &clusters {
            let first = geom.clusters_to_blocks(cluster);
            for blkno in first..first + u64::from(geom.blocks_per_cluster()) {
                self.write_block(blkno, &zero)?;
            }
        }
        self.refresh_backup_super(blocks)?;
        for &cluster in &clusters {
            self.force_bit(SystemFile::GlobalBitmap, None, cluster)?;
        }
        self.write_allocator(SystemFile::GlobalBitmap, None)?;
        debug!(copies = blocks.len(), "backup_super_set");
        Ok(())
    }

    /// Create backups at every location that fits and set the compat bit.
    pub fn enable_backup_super(&mut self) -> Result<usize> {
        let blocks = self.backup_super_blocks();
        if blocks.is_empty() {
            return Err(O2Error::NoSpace);
        }
        self.set_backup_super(&blocks)?;
        let sb = self.superblock_mut();
        sb.feature_compat = sb.feature_compat.with(CompatFeatures::BACKUP_SB);
        self.write_super()?;
        Ok(blocks.len())
    }

    /// Release the backup clusters and clear the compat bit.
    ///
    /// Without the compat bit those clusters may hold live data, so this is
    /// a no-op returning `false`.
    pub fn clear_backup_super(&mut self) -> Result<bool> {
        self.check_writable()?;
        if !self.superblock().feature_compat.contains(CompatFeatures::BACKUP_SB) {
            debug!("backup_super_clear_skipped");
            return Ok(false);
        }
        let geom = self.geometry();
        for blkno in self.backup_super_blocks() {
            let cluster = geom.block_to_cluster(BlockNumber(blkno)).0;
            if self.test_bit(SystemFile::GlobalBitmap, None, cluster)? {
                self.free_bits(SystemFile::GlobalBitmap, None, cluster, 1)?;
            }
        }
        self.write_allocator(SystemFile::GlobalBitmap, None)?;
        let sb = self.superblock_mut();
        sb.feature_compat = sb.feature_compat.without(CompatFeatures::BACKUP_SB);
        self.write_super()?;
        debug!("backup_super_cleared");
        Ok(true)
    }
}
