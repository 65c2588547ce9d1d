#![forbid(unsafe_code)]
//! Feature-flag words for the volume superblock and the journal superblock,
//! plus the inode flag words that share the same named-bit machinery.

use serde::{Deserialize, Serialize};

/// Define a flag newtype over a raw integer word with a `(bit, name)` table.
macro_rules! flag_word {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $($flag:ident = $bit:expr, $label:literal;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $flag: Self = Self($bit);)*

            /// All named bits, in display order.
            pub const KNOWN: &'static [($repr, &'static str)] = &[$(($bit, $label)),*];

            #[must_use]
            pub fn bits(self) -> $repr {
                self.0
            }

            #[must_use]
            pub fn contains(self, flag: Self) -> bool {
                (self.0 & flag.0) == flag.0
            }

            #[must_use]
            pub fn intersects(self, flag: Self) -> bool {
                (self.0 & flag.0) != 0
            }

            #[must_use]
            pub fn with(self, flag: Self) -> Self {
                Self(self.0 | flag.0)
            }

            #[must_use]
            pub fn without(self, flag: Self) -> Self {
                Self(self.0 & !flag.0)
            }

            /// Names of all set, known bits.
            #[must_use]
            pub fn describe(self) -> Vec<&'static str> {
                Self::KNOWN
                    .iter()
                    .filter(|(bit, _)| self.0 & bit != 0)
                    .map(|(_, name)| *name)
                    .collect()
            }

            /// Set bits not covered by any named constant.
            #[must_use]
            pub fn unknown_bits(self) -> $repr {
                let known: $repr = Self::KNOWN.iter().fold(0, |acc, (bit, _)| acc | bit);
                self.0 & !known
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                format_flags(f, u64::from(self.0), Self::KNOWN.iter().map(|(b, n)| (u64::from(*b), *n)))
            }
        }
    };
}

flag_word! {
    /// Volume compatible features (`s_feature_compat`).
    CompatFeatures(u32) {
        BACKUP_SB = 0x0001, "BACKUP_SB";
        JBD2_SB = 0x0002, "JBD2_SB";
    }
}

flag_word! {
    /// Volume incompatible features (`s_feature_incompat`).
    ///
    /// Any set bit outside [`IncompatFeatures::SUPPORTED`] makes the volume
    /// unsafe for this engine to interpret.
    IncompatFeatures(u32) {
        HEARTBEAT_DEV = 0x0002, "HEARTBEAT_DEV";
        RESIZE_INPROG = 0x0004, "RESIZE_INPROG";
        LOCAL_MOUNT = 0x0008, "LOCAL_MOUNT";
        SPARSE_ALLOC = 0x0010, "SPARSE_ALLOC";
        TUNEFS_INPROG = 0x0020, "TUNEFS_INPROG";
        INLINE_DATA = 0x0040, "INLINE_DATA";
        USERSPACE_STACK = 0x0080, "USERSPACE_STACK";
        EXTENDED_SLOT_MAP = 0x0100, "EXTENDED_SLOT_MAP";
        XATTR = 0x0200, "XATTR";
        INDEXED_DIRS = 0x0400, "INDEXED_DIRS";
        META_ECC = 0x0800, "META_ECC";
        REFCOUNT_TREE = 0x1000, "REFCOUNT_TREE";
        DISCONTIG_BG = 0x2000, "DISCONTIG_BG";
        CLUSTERINFO = 0x4000, "CLUSTERINFO";
        APPEND_DIO = 0x8000, "APPEND_DIO";
    }
}

impl IncompatFeatures {
    /// Incompat bits whose on-disk consequences this engine handles.
    pub const SUPPORTED: Self = Self(
        Self::LOCAL_MOUNT.0
            | Self::SPARSE_ALLOC.0
            | Self::INLINE_DATA.0
            | Self::USERSPACE_STACK.0
            | Self::EXTENDED_SLOT_MAP.0
            | Self::XATTR.0
            | Self::REFCOUNT_TREE.0
            | Self::CLUSTERINFO.0
            | Self::APPEND_DIO.0,
    );

    /// Set bits this engine refuses, named or not.
    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }
}

flag_word! {
    /// Volume read-only compatible features (`s_feature_ro_compat`).
    RoCompatFeatures(u32) {
        UNWRITTEN = 0x0001, "UNWRITTEN";
        USRQUOTA = 0x0002, "USRQUOTA";
        GRPQUOTA = 0x0004, "GRPQUOTA";
    }
}

flag_word! {
    /// Inode flags (`i_flags`).
    InodeFlags(u32) {
        VALID = 0x0001, "VALID";
        UNUSED2 = 0x0002, "UNUSED2";
        ORPHANED = 0x0004, "ORPHANED";
        UNUSED3 = 0x0008, "UNUSED3";
        SYSTEM = 0x0010, "SYSTEM";
        SUPER_BLOCK = 0x0020, "SUPER_BLOCK";
        LOCAL_ALLOC = 0x0040, "LOCAL_ALLOC";
        BITMAP = 0x0080, "BITMAP";
        JOURNAL = 0x0100, "JOURNAL";
        HEARTBEAT = 0x0200, "HEARTBEAT";
        CHAIN = 0x0400, "CHAIN";
        DEALLOC = 0x0800, "DEALLOC";
        QUOTA = 0x1000, "QUOTA";
    }
}

flag_word! {
    /// Dynamic inode features (`i_dyn_features`).
    DynFeatures(u16) {
        INLINE_DATA = 0x0001, "INLINE_DATA";
        HAS_XATTR = 0x0002, "HAS_XATTR";
        INLINE_XATTR = 0x0004, "INLINE_XATTR";
        INDEXED_DIR = 0x0008, "INDEXED_DIR";
        HAS_REFCOUNT = 0x0010, "HAS_REFCOUNT";
    }
}

flag_word! {
    /// Journal compatible features.
    JournalCompat(u32) {
        CHECKSUM = 0x0001, "CHECKSUM";
    }
}

flag_word! {
    /// Journal incompatible features.
    JournalIncompat(u32) {
        REVOKE = 0x0001, "REVOKE";
        BIT64 = 0x0002, "64BIT";
        ASYNC_COMMIT = 0x0004, "ASYNC_COMMIT";
    }
}

flag_word! {
    /// Journal read-only compatible features. No bits are defined.
    JournalRoCompat(u32) {}
}

// ── Feature diagnostics ─────────────────────────────────────────────────────

/// Structured report of a volume's feature words against what this engine
/// supports. Produced by `Superblock::feature_diagnostics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureDiagnostics {
    /// Named incompat features that are set but unsupported.
    pub rejected_present: Vec<&'static str>,
    /// Raw unsupported incompat bits, named or not.
    pub unsupported_incompat_bits: u32,
    /// Raw unknown ro_compat bits.
    pub unknown_ro_compat_bits: u32,
    pub compat_display: String,
    pub incompat_display: String,
    pub ro_compat_display: String,
}

impl FeatureDiagnostics {
    #[must_use]
    pub fn new(
        compat: CompatFeatures,
        incompat: IncompatFeatures,
        ro_compat: RoCompatFeatures,
    ) -> Self {
        let unsupported = incompat.unsupported_bits();
        Self {
            rejected_present: IncompatFeatures(unsupported).describe(),
            unsupported_incompat_bits: unsupported,
            unknown_ro_compat_bits: ro_compat.unknown_bits(),
            compat_display: compat.to_string(),
            incompat_display: incompat.to_string(),
            ro_compat_display: ro_compat.to_string(),
        }
    }

    /// True when the volume can be opened by this engine.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.unsupported_incompat_bits == 0
    }
}

impl std::fmt::Display for FeatureDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "compat={}, incompat={}, ro_compat={}",
            self.compat_display, self.incompat_display, self.ro_compat_display
        )?;
        if !self.rejected_present.is_empty() {
            write!(f, "; rejected: {}", self.rejected_present.join(", "))?;
        }
        let unnamed = IncompatFeatures(self.unsupported_incompat_bits).unknown_bits();
        if unnamed != 0 {
            write!(f, "; unknown incompat: 0x{unnamed:X}")?;
        }
        if self.unknown_ro_compat_bits != 0 {
            write!(f, "; unknown ro_compat: 0x{:X}", self.unknown_ro_compat_bits)?;
        }
        Ok(())
    }
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `SPARSE_ALLOC|INLINE_DATA` or `(none)` when zero.
/// Unknown bits are appended as hex, e.g. `XATTR|0x80000000`.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u64,
    known: impl Iterator<Item = (u64, &'static str)>,
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for (bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}
