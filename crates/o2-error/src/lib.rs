#![forbid(unsafe_code)]
//! Error types for the o2 metadata engine.
//!
//! # Error Taxonomy
//!
//! The engine uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `o2-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `O2Error` | `o2-error` (this crate) | Errors returned by every engine operation |
//!
//! `o2-error` does not depend on `o2-types`. The conversion from `ParseError`
//! to `O2Error` lives in `o2-core`, which knows the block a structure was read
//! from and can attach it to [`O2Error::Corruption`].
//!
//! ## Error classes
//!
//! | Class | Variants | Caller reaction |
//! |-------|----------|-----------------|
//! | I/O | `Io` | propagate, never retried |
//! | Structural | `Corruption`, `Format`, `Parse` | stop traversal, hand to repair tooling |
//! | Capacity | `NoSpace`, `DirFull` | grow the directory or pick another region |
//! | Policy | `ReadOnly`, `UnsupportedFeature`, `InvalidGeometry` | fatal to the operation |
//! | Lookup | `NotFound`, `NotDirectory`, `SymlinkLoop` | branch on the outcome |
//!
//! Lookup misses inside a single directory and offsets beyond the end of an
//! extent list are returned as typed values, not errors. `NotFound` is
//! reserved for operations that cannot continue without the named object
//! (path resolution, unlink, missing system inodes).
//!
//! ## errno Mapping
//!
//! Every `O2Error` variant maps to exactly one POSIX errno via
//! [`O2Error::to_errno`]. The match is exhaustive so a new variant does not
//! compile until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidArgument` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NoSpace` / `DirFull` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `SymlinkLoop` | `ELOOP` |
//! | `LockUnavailable` | `EAGAIN` |
//! | `FreeingUnallocated` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum O2Error {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Raised for bad signatures on live metadata, extent depth mismatches,
    /// malformed directory records, and chain free-count disagreements. The
    /// `block` field is what repair tooling needs for triage.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The volume is not in a format this engine understands.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without a known block number.
    #[error("parse error: {0}")]
    Parse(String),

    /// The volume has an incompatible feature bit this engine cannot interpret.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Block size, cluster size, or volume bounds are out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A caller-supplied argument does not fit the target object.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No allocation group can satisfy the request.
    #[error("no space left on device")]
    NoSpace,

    /// No existing directory record can hold the new name.
    ///
    /// The caller grows the directory and retries.
    #[error("directory has no room for a new entry")]
    DirFull,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The handle was opened read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Name exceeds 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Target name already present in the directory.
    #[error("file exists")]
    Exists,

    /// Symlink chain exceeded the follow limit.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,

    /// The cluster lock service refused the lock.
    #[error("lock {0} not available")]
    LockUnavailable(String),

    /// A free request covered bits that were already clear.
    #[error("freeing unallocated region at unit {unit}")]
    FreeingUnallocated { unit: u64 },
}

impl O2Error {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_)
            | Self::FreeingUnallocated { .. } => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NoSpace | Self::DirFull => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::SymlinkLoop => libc::ELOOP,
            Self::LockUnavailable(_) => libc::EAGAIN,
        }
    }

    /// True for expected capacity outcomes the caller can recover from.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoSpace | Self::DirFull)
    }

    /// True for structural errors that make further traversal untrustworthy.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::Format(_) | Self::Parse(_)
        )
    }
}

/// Result alias using `O2Error`.
pub type Result<T> = std::result::Result<T, O2Error>;
