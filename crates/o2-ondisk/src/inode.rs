#![forbid(unsafe_code)]

use crate::chain::ChainList;
use crate::extent::{ExtentList, extent_recs_per_inode};
use crate::features::{CompatFeatures, DynFeatures, IncompatFeatures, InodeFlags, RoCompatFeatures};
use crate::features::FeatureDiagnostics;
use o2_types::{
    ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded,
    write_bytes, write_le_u16, write_le_u32, write_le_u64,
};

pub const INODE_SIGNATURE: &[u8] = b"INODE01";
pub const SUPER_BLOCK_SIGNATURE: &[u8] = b"OCFSV2";

pub const DINODE_ID1_OFFSET: usize = 0xB8;
pub const DINODE_ID2_OFFSET: usize = 0xC0;
/// Inline file data starts after the `id_count` header.
pub const INLINE_DATA_OFFSET: usize = 0xC8;

pub const MAX_VOL_LABEL_LEN: usize = 64;
pub const VOL_UUID_LEN: usize = 16;

/// `ij_flags` bit forcing journal recovery on next mount.
pub const JOURNAL_DIRTY_FL: u32 = 0x0000_0001;

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFSOCK: u16 = 0o140_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFBLK: u16 = 0o060_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFIFO: u16 = 0o010_000;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Volume superblock body, stored in the payload of the block-2 inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub major_rev_level: u16,
    pub minor_rev_level: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub state: u16,
    pub errors: u16,
    pub checkinterval: u32,
    pub lastcheck: u64,
    pub creator_os: u32,
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub root_blkno: u64,
    pub system_dir_blkno: u64,
    pub blocksize_bits: u32,
    pub clustersize_bits: u32,
    pub max_slots: u16,
    pub tunefs_flag: u16,
    pub uuid_hash: u32,
    pub first_cluster_group: u64,
    pub label: [u8; MAX_VOL_LABEL_LEN],
    pub uuid: [u8; VOL_UUID_LEN],
}

impl Superblock {
    const BASE: usize = DINODE_ID2_OFFSET;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let b = Self::BASE;
        Ok(Self {
            major_rev_level: read_le_u16(data, b)?,
            minor_rev_level: read_le_u16(data, b + 0x02)?,
            mnt_count: read_le_u16(data, b + 0x04)?,
            max_mnt_count: read_le_u16(data, b + 0x06)?,
            state: read_le_u16(data, b + 0x08)?,
            errors: read_le_u16(data, b + 0x0A)?,
            checkinterval: read_le_u32(data, b + 0x0C)?,
            lastcheck: read_le_u64(data, b + 0x10)?,
            creator_os: read_le_u32(data, b + 0x18)?,
            feature_compat: CompatFeatures(read_le_u32(data, b + 0x1C)?),
            feature_incompat: IncompatFeatures(read_le_u32(data, b + 0x20)?),
            feature_ro_compat: RoCompatFeatures(read_le_u32(data, b + 0x24)?),
            root_blkno: read_le_u64(data, b + 0x28)?,
            system_dir_blkno: read_le_u64(data, b + 0x30)?,
            blocksize_bits: read_le_u32(data, b + 0x38)?,
            clustersize_bits: read_le_u32(data, b + 0x3C)?,
            max_slots: read_le_u16(data, b + 0x40)?,
            tunefs_flag: read_le_u16(data, b + 0x42)?,
            uuid_hash: read_le_u32(data, b + 0x44)?,
            first_cluster_group: read_le_u64(data, b + 0x48)?,
            label: read_fixed::<MAX_VOL_LABEL_LEN>(data, b + 0x50)?,
            uuid: read_fixed::<VOL_UUID_LEN>(data, b + 0x90)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        let b = Self::BASE;
        write_le_u16(data, b, self.major_rev_level)?;
        write_le_u16(data, b + 0x02, self.minor_rev_level)?;
        write_le_u16(data, b + 0x04, self.mnt_count)?;
        write_le_u16(data, b + 0x06, self.max_mnt_count)?;
        write_le_u16(data, b + 0x08, self.state)?;
        write_le_u16(data, b + 0x0A, self.errors)?;
        write_le_u32(data, b + 0x0C, self.checkinterval)?;
        write_le_u64(data, b + 0x10, self.lastcheck)?;
        write_le_u32(data, b + 0x18, self.creator_os)?;
        write_le_u32(data, b + 0x1C, self.feature_compat.0)?;
        write_le_u32(data, b + 0x20, self.feature_incompat.0)?;
        write_le_u32(data, b + 0x24, self.feature_ro_compat.0)?;
        write_le_u64(data, b + 0x28, self.root_blkno)?;
        write_le_u64(data, b + 0x30, self.system_dir_blkno)?;
        write_le_u32(data, b + 0x38, self.blocksize_bits)?;
        write_le_u32(data, b + 0x3C, self.clustersize_bits)?;
        write_le_u16(data, b + 0x40, self.max_slots)?;
        write_le_u16(data, b + 0x42, self.tunefs_flag)?;
        write_le_u32(data, b + 0x44, self.uuid_hash)?;
        write_le_u64(data, b + 0x48, self.first_cluster_group)?;
        write_bytes(data, b + 0x50, &self.label)?;
        write_bytes(data, b + 0x90, &self.uuid)
    }

    #[must_use]
    pub fn label_str(&self) -> String {
        trim_nul_padded(&self.label)
    }

    /// UUID as 32 uppercase hex digits.
    #[must_use]
    pub fn uuid_hex(&self) -> String {
        hex::encode_upper(self.uuid)
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        1_u64 << self.blocksize_bits.min(63)
    }

    #[must_use]
    pub fn feature_diagnostics(&self) -> FeatureDiagnostics {
        FeatureDiagnostics::new(
            self.feature_compat,
            self.feature_incompat,
            self.feature_ro_compat,
        )
    }
}

// ── Inode payload ───────────────────────────────────────────────────────────

/// Small file or directory contents stored inside the inode block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineData {
    /// Capacity of the inline area (`id_count`).
    pub count: u16,
    pub data: Vec<u8>,
}

/// The `id2` union, decoded according to the inode's flags and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodePayload {
    Super(Box<Superblock>),
    Chain(ChainList),
    Extents(ExtentList),
    Inline(InlineData),
    /// Symlink target stored directly in the inode.
    FastSymlink(Vec<u8>),
    /// Local-alloc window or truncate log, preserved byte-for-byte.
    Opaque(Vec<u8>),
}

// ── Dinode ──────────────────────────────────────────────────────────────────

/// On-disk inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dinode {
    pub signature: [u8; 8],
    pub generation: u32,
    pub suballoc_slot: u16,
    pub suballoc_bit: u16,
    pub links_count_hi: u16,
    pub xattr_inline_size: u16,
    pub clusters: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mode: u16,
    pub links_count: u16,
    pub flags: InodeFlags,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub dtime: u64,
    pub blkno: u64,
    pub last_eb_blk: u64,
    pub fs_generation: u32,
    pub atime_nsec: u32,
    pub ctime_nsec: u32,
    pub mtime_nsec: u32,
    pub attr: u32,
    pub orphaned_slot: u16,
    pub dyn_features: DynFeatures,
    pub xattr_loc: u64,
    pub dx_root: u64,
    pub refcount_loc: u64,
    pub suballoc_loc: u64,
    /// Raw `id1` union: device number, bitmap counters, or journal flags.
    pub id1: u64,
    pub id2: InodePayload,
}

impl Dinode {
    /// Decode an inode block. Accepts either the inode or superblock signature.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let signature = read_fixed::<8>(data, 0)?;
        if !signature.starts_with(INODE_SIGNATURE) && !signature.starts_with(SUPER_BLOCK_SIGNATURE)
        {
            return Err(ParseError::InvalidMagic {
                expected: String::from_utf8_lossy(INODE_SIGNATURE).into_owned(),
                actual: String::from_utf8_lossy(&signature).into_owned(),
            });
        }

        let flags = InodeFlags(read_le_u32(data, 0x2C)?);
        let dyn_features = DynFeatures(read_le_u16(data, 0x76)?);
        let mode = read_le_u16(data, 0x28)?;
        let clusters = read_le_u32(data, 0x14)?;
        let id2 = parse_payload(data, flags, dyn_features, mode, clusters)?;

        Ok(Self {
            signature,
            generation: read_le_u32(data, 0x08)?,
            suballoc_slot: read_le_u16(data, 0x0C)?,
            suballoc_bit: read_le_u16(data, 0x0E)?,
            links_count_hi: read_le_u16(data, 0x10)?,
            xattr_inline_size: read_le_u16(data, 0x12)?,
            clusters,
            uid: read_le_u32(data, 0x18)?,
            gid: read_le_u32(data, 0x1C)?,
            size: read_le_u64(data, 0x20)?,
            mode,
            links_count: read_le_u16(data, 0x2A)?,
            flags,
            atime: read_le_u64(data, 0x30)?,
            ctime: read_le_u64(data, 0x38)?,
            mtime: read_le_u64(data, 0x40)?,
            dtime: read_le_u64(data, 0x48)?,
            blkno: read_le_u64(data, 0x50)?,
            last_eb_blk: read_le_u64(data, 0x58)?,
            fs_generation: read_le_u32(data, 0x60)?,
            atime_nsec: read_le_u32(data, 0x64)?,
            ctime_nsec: read_le_u32(data, 0x68)?,
            mtime_nsec: read_le_u32(data, 0x6C)?,
            attr: read_le_u32(data, 0x70)?,
            orphaned_slot: read_le_u16(data, 0x74)?,
            dyn_features,
            xattr_loc: read_le_u64(data, 0x78)?,
            dx_root: read_le_u64(data, 0x88)?,
            refcount_loc: read_le_u64(data, 0x90)?,
            suballoc_loc: read_le_u64(data, 0x98)?,
            id1: read_le_u64(data, DINODE_ID1_OFFSET)?,
            id2,
        })
    }

    /// Encode over an existing block buffer; bytes this type does not model
    /// (checksums, reserved words) are left as they were.
    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(data, 0, &self.signature)?;
        write_le_u32(data, 0x08, self.generation)?;
        write_le_u16(data, 0x0C, self.suballoc_slot)?;
        write_le_u16(data, 0x0E, self.suballoc_bit)?;
        write_le_u16(data, 0x10, self.links_count_hi)?;
        write_le_u16(data, 0x12, self.xattr_inline_size)?;
        write_le_u32(data, 0x14, self.clusters)?;
        write_le_u32(data, 0x18, self.uid)?;
        write_le_u32(data, 0x1C, self.gid)?;
        write_le_u64(data, 0x20, self.size)?;
        write_le_u16(data, 0x28, self.mode)?;
        write_le_u16(data, 0x2A, self.links_count)?;
        write_le_u32(data, 0x2C, self.flags.0)?;
        write_le_u64(data, 0x30, self.atime)?;
        write_le_u64(data, 0x38, self.ctime)?;
        write_le_u64(data, 0x40, self.mtime)?;
        write_le_u64(data, 0x48, self.dtime)?;
        write_le_u64(data, 0x50, self.blkno)?;
        write_le_u64(data, 0x58, self.last_eb_blk)?;
        write_le_u32(data, 0x60, self.fs_generation)?;
        write_le_u32(data, 0x64, self.atime_nsec)?;
        write_le_u32(data, 0x68, self.ctime_nsec)?;
        write_le_u32(data, 0x6C, self.mtime_nsec)?;
        write_le_u32(data, 0x70, self.attr)?;
        write_le_u16(data, 0x74, self.orphaned_slot)?;
        write_le_u16(data, 0x76, self.dyn_features.0)?;
        write_le_u64(data, 0x78, self.xattr_loc)?;
        write_le_u64(data, 0x88, self.dx_root)?;
        write_le_u64(data, 0x90, self.refcount_loc)?;
        write_le_u64(data, 0x98, self.suballoc_loc)?;
        write_le_u64(data, DINODE_ID1_OFFSET, self.id1)?;

        match &self.id2 {
            InodePayload::Super(sb) => sb.encode_into(data),
            InodePayload::Chain(cl) => cl.encode_into(data, DINODE_ID2_OFFSET),
            InodePayload::Extents(el) => el.encode_into(data, DINODE_ID2_OFFSET),
            InodePayload::Inline(inline) => {
                if inline.data.len() > usize::from(inline.count) {
                    return Err(ParseError::InvalidField {
                        field: "id_count",
                        reason: "inline data exceeds capacity",
                    });
                }
                write_le_u16(data, DINODE_ID2_OFFSET, inline.count)?;
                write_le_u16(data, DINODE_ID2_OFFSET + 2, 0)?;
                write_le_u32(data, DINODE_ID2_OFFSET + 4, 0)?;
                let mut area = vec![0_u8; usize::from(inline.count)];
                area[..inline.data.len()].copy_from_slice(&inline.data);
                write_bytes(data, INLINE_DATA_OFFSET, &area)
            }
            InodePayload::FastSymlink(bytes) | InodePayload::Opaque(bytes) => {
                write_bytes(data, DINODE_ID2_OFFSET, bytes)
            }
        }
    }

    #[must_use]
    pub fn is_superblock(&self) -> bool {
        self.signature.starts_with(SUPER_BLOCK_SIGNATURE)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(InodeFlags::VALID)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        self.dyn_features.contains(DynFeatures::INLINE_DATA)
    }

    #[must_use]
    pub fn is_chain_allocator(&self) -> bool {
        self.flags.contains(InodeFlags::CHAIN)
    }

    #[must_use]
    pub fn superblock(&self) -> Option<&Superblock> {
        match &self.id2 {
            InodePayload::Super(sb) => Some(sb),
            _ => None,
        }
    }

    #[must_use]
    pub fn extent_list(&self) -> Option<&ExtentList> {
        match &self.id2 {
            InodePayload::Extents(el) => Some(el),
            _ => None,
        }
    }

    pub fn extent_list_mut(&mut self) -> Option<&mut ExtentList> {
        match &mut self.id2 {
            InodePayload::Extents(el) => Some(el),
            _ => None,
        }
    }

    #[must_use]
    pub fn chain_list(&self) -> Option<&ChainList> {
        match &self.id2 {
            InodePayload::Chain(cl) => Some(cl),
            _ => None,
        }
    }

    pub fn chain_list_mut(&mut self) -> Option<&mut ChainList> {
        match &mut self.id2 {
            InodePayload::Chain(cl) => Some(cl),
            _ => None,
        }
    }

    #[must_use]
    pub fn inline_data(&self) -> Option<&InlineData> {
        match &self.id2 {
            InodePayload::Inline(inline) => Some(inline),
            _ => None,
        }
    }

    /// `bitmap1.i_used`.
    #[must_use]
    pub fn bitmap_used(&self) -> u32 {
        (self.id1 & 0xFFFF_FFFF) as u32
    }

    /// `bitmap1.i_total`.
    #[must_use]
    pub fn bitmap_total(&self) -> u32 {
        (self.id1 >> 32) as u32
    }

    pub fn set_bitmap_counts(&mut self, used: u32, total: u32) {
        self.id1 = (u64::from(total) << 32) | u64::from(used);
    }

    /// `journal1.ij_flags`.
    #[must_use]
    pub fn journal_flags(&self) -> u32 {
        (self.id1 & 0xFFFF_FFFF) as u32
    }

    pub fn set_journal_flags(&mut self, flags: u32) {
        self.id1 = (self.id1 & 0xFFFF_FFFF_0000_0000) | u64::from(flags);
    }

    /// Total link count, combining the high and low halves.
    #[must_use]
    pub fn links(&self) -> u32 {
        (u32::from(self.links_count_hi) << 16) | u32::from(self.links_count)
    }
}

fn parse_payload(
    data: &[u8],
    flags: InodeFlags,
    dyn_features: DynFeatures,
    mode: u16,
    clusters: u32,
) -> Result<InodePayload, ParseError> {
    if flags.contains(InodeFlags::SUPER_BLOCK) {
        return Ok(InodePayload::Super(Box::new(Superblock::parse(data)?)));
    }
    if flags.contains(InodeFlags::CHAIN) {
        return Ok(InodePayload::Chain(ChainList::parse(data, DINODE_ID2_OFFSET)?));
    }
    if flags.intersects(InodeFlags::LOCAL_ALLOC.with(InodeFlags::DEALLOC)) {
        let rest = ensure_slice(data, DINODE_ID2_OFFSET, data.len().saturating_sub(DINODE_ID2_OFFSET))?;
        return Ok(InodePayload::Opaque(rest.to_vec()));
    }
    if dyn_features.contains(DynFeatures::INLINE_DATA) {
        let count = read_le_u16(data, DINODE_ID2_OFFSET)?;
        let bytes = ensure_slice(data, INLINE_DATA_OFFSET, usize::from(count))?;
        return Ok(InodePayload::Inline(InlineData {
            count,
            data: bytes.to_vec(),
        }));
    }
    if mode & S_IFMT == S_IFLNK && clusters == 0 {
        let rest = ensure_slice(data, DINODE_ID2_OFFSET, data.len().saturating_sub(DINODE_ID2_OFFSET))?;
        return Ok(InodePayload::FastSymlink(rest.to_vec()));
    }
    Ok(InodePayload::Extents(ExtentList::parse(data, DINODE_ID2_OFFSET)?))
}

/// Bytes available for inline data in an inode of `block_size`.
#[must_use]
pub fn max_inline_data(block_size: usize) -> u16 {
    u16::try_from(block_size.saturating_sub(INLINE_DATA_OFFSET)).unwrap_or(u16::MAX)
}

/// Longest symlink target that fits in the inode.
#[must_use]
pub fn fast_symlink_chars(block_size: usize) -> usize {
    block_size.saturating_sub(DINODE_ID2_OFFSET)
}

/// A fresh, valid inode with an empty depth-0 extent list.
#[must_use]
pub fn new_dinode(block_size: usize, blkno: u64, mode: u16, fs_generation: u32) -> Dinode {
    Dinode {
        signature: signature8(INODE_SIGNATURE),
        generation: 0,
        suballoc_slot: 0,
        suballoc_bit: 0,
        links_count_hi: 0,
        xattr_inline_size: 0,
        clusters: 0,
        uid: 0,
        gid: 0,
        size: 0,
        mode,
        links_count: 1,
        flags: InodeFlags::VALID,
        atime: 0,
        ctime: 0,
        mtime: 0,
        dtime: 0,
        blkno,
        last_eb_blk: 0,
        fs_generation,
        atime_nsec: 0,
        ctime_nsec: 0,
        mtime_nsec: 0,
        attr: 0,
        orphaned_slot: 0,
        dyn_features: DynFeatures(0),
        xattr_loc: 0,
        dx_root: 0,
        refcount_loc: 0,
        suballoc_loc: 0,
        id1: 0,
        id2: InodePayload::Extents(ExtentList::empty(extent_recs_per_inode(block_size))),
    }
}

/// NUL-pad a signature to the 8-byte field width.
#[must_use]
pub fn signature8(sig: &[u8]) -> [u8; 8] {
    let mut out = [0_u8; 8];
    let len = sig.len().min(8);
    out[..len].copy_from_slice(&sig[..len]);
    out
}
